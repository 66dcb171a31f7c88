use std::sync::Once;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Install the process-wide tracing subscriber. The filter comes from
/// `RUST_LOG` when set, otherwise `info` (`debug` when the debug flag is on).
pub fn setup_logging(debug: bool) {
	INIT.call_once(|| {
		let fallback = if debug { "debug" } else { "info" };
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer())
			.init();
	});
}

pub mod testing {
	use std::sync::Once;

	static INIT: Once = Once::new();

	/// Idempotent subscriber for tests; output is captured per-test.
	pub fn setup_test_logging() {
		INIT.call_once(|| {
			let filter = tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
			let _ = tracing_subscriber::fmt()
				.with_env_filter(filter)
				.with_test_writer()
				.try_init();
		});
	}
}
