//! CONNECT bridge: after the 200 reaches the client, terminate TLS on the
//! taken-over socket under a leaf minted for the tunnel target, then re-read
//! plaintext requests from inside the session.

use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use super::{Envelope, Proxy, ProxyError, page};

pub(super) async fn tunnel(proxy: Proxy, upgraded: Upgraded, envelope: Envelope) {
	let mut io = TokioIo::new(upgraded);

	let tls_config = match proxy
		.certs
		.get(&envelope.host)
		.await
		.and_then(|leaf| leaf.server_config())
	{
		Ok(config) => config,
		Err(e) => {
			warn!(
				request_id = %envelope.id_hex(),
				host = %envelope.host,
				error = %ProxyError::Certificate(e),
				"leaf certificate unavailable"
			);
			write_error_page(&mut io, &envelope).await;
			return;
		},
	};

	let stream = match TlsAcceptor::from(Arc::new(tls_config)).accept(io).await {
		Ok(stream) => stream,
		Err(e) => {
			// A failed handshake leaves no channel to carry a response.
			debug!(
				request_id = %envelope.id_hex(),
				host = %envelope.host,
				error = %e,
				"mitm handshake failed"
			);
			return;
		},
	};

	let service = service_fn(move |req| {
		let proxy = proxy.clone();
		let envelope = envelope.clone();
		async move {
			Ok::<_, std::convert::Infallible>(proxy.handle_tunneled(req, &envelope).await)
		}
	});
	// The client closing the tunnel between requests is the normal end of a
	// session, not an error worth surfacing.
	if let Err(e) = http1::Builder::new()
		.serve_connection(TokioIo::new(stream), service)
		.await
	{
		debug!(error = %e, "tunnel closed");
	}
}

async fn write_error_page<W: tokio::io::AsyncWrite + Unpin>(io: &mut W, envelope: &Envelope) {
	let bytes = page::internal_error_bytes(&envelope.id_hex());
	if let Err(e) = io.write_all(&bytes).await {
		debug!(request_id = %envelope.id_hex(), error = %e, "error page write failed");
	}
	let _ = io.shutdown().await;
}
