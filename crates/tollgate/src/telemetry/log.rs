//! Per-request attribute record. The record is filled in as the request
//! moves through the pipeline and emitted exactly once when it drops, so
//! every exit path (including early errors) produces a log line.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, warn};

pub struct RequestLog {
	pub id: String,
	pub method: http::Method,
	pub client: SocketAddr,
	pub target: Option<String>,
	pub status: Option<u16>,
	pub error: Option<String>,
	start: Instant,
}

impl RequestLog {
	pub fn new(id: String, method: http::Method, client: SocketAddr) -> Self {
		RequestLog {
			id,
			method,
			client,
			target: None,
			status: None,
			error: None,
			start: Instant::now(),
		}
	}
}

impl Drop for RequestLog {
	fn drop(&mut self) {
		let duration_ms = self.start.elapsed().as_millis() as u64;
		let target = self.target.as_deref().unwrap_or("unknown");
		match &self.error {
			Some(error) => warn!(
				request_id = %self.id,
				method = %self.method,
				client = %self.client,
				url = target,
				error = %error,
				duration_ms,
				"request failed"
			),
			None => debug!(
				request_id = %self.id,
				method = %self.method,
				client = %self.client,
				url = target,
				status = self.status.unwrap_or_default(),
				duration_ms,
				"request complete"
			),
		}
	}
}
