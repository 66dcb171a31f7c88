//! Outbound HTTP(S) client shared by every proxied request.

use std::sync::Arc;

use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy;
use hyper_util::rt::TokioExecutor;
use rustls::RootCertStore;
use rustls::crypto::aws_lc_rs;
use rustls_pki_types::CertificateDer;
use tracing::warn;

use crate::http::{Body, Request, Response};

type Connector = HttpsConnector<legacy::connect::HttpConnector>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("upstream request: {0}")]
	Request(#[from] legacy::Error),
	#[error("tls configuration: {0}")]
	Tls(#[from] rustls::Error),
}

/// Forwards requests upstream and hands the streaming response back. One
/// client (and its connection pool) serves the whole process.
#[derive(Clone)]
pub struct Client {
	client: legacy::Client<Connector, Body>,
}

impl std::fmt::Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client").finish_non_exhaustive()
	}
}

impl Client {
	/// Build the client against the platform trust store, optionally
	/// extended with additional root certificates.
	pub fn new(extra_roots: &[CertificateDer<'static>]) -> Result<Self, ClientError> {
		let mut roots = RootCertStore::empty();
		let native = rustls_native_certs::load_native_certs();
		if !native.errors.is_empty() {
			warn!(errors = ?native.errors, "some platform trust roots failed to load");
		}
		let (_added, ignored) = roots.add_parsable_certificates(native.certs);
		if ignored > 0 {
			warn!(ignored, "ignored unparseable platform trust roots");
		}
		for root in extra_roots {
			roots.add(root.clone())?;
		}

		let tls = rustls::ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
			.with_protocol_versions(rustls::ALL_VERSIONS)?
			.with_root_certificates(roots)
			.with_no_client_auth();

		let connector = HttpsConnectorBuilder::new()
			.with_tls_config(tls)
			.https_or_http()
			.enable_http1()
			.build();
		let client = legacy::Client::builder(TokioExecutor::new()).build(connector);
		Ok(Client { client })
	}

	pub async fn request(&self, req: Request) -> Result<Response, ClientError> {
		let resp = self.client.request(req).await?;
		Ok(resp.map(Body::new))
	}
}
