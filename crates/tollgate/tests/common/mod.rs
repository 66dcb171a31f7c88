// Shared fixtures: a throwaway CA, a proxy harness on an ephemeral port,
// and a TLS upstream serving under a leaf from the same CA.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tollgate::handlers::ResponseHandler;
use tollgate::tls::{Authority, CertStore};
use tollgate::{Client, Proxy};

/// A test CA whose material can be re-parsed into as many `Authority`
/// instances as a test needs (the proxy's store consumes one).
pub struct TestCa {
	pub cert_pem: String,
	pub key_pem: String,
}

impl TestCa {
	pub fn new() -> Self {
		let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
		let mut params = rcgen::CertificateParams::default();
		let mut dn = rcgen::DistinguishedName::new();
		dn.push(rcgen::DnType::CommonName, "tollgate test CA");
		dn.push(rcgen::DnType::OrganizationName, "tollgate");
		params.distinguished_name = dn;
		params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
		params.key_usages = vec![
			rcgen::KeyUsagePurpose::KeyCertSign,
			rcgen::KeyUsagePurpose::DigitalSignature,
		];
		let cert = params.self_signed(&key).unwrap();
		TestCa {
			cert_pem: cert.pem(),
			key_pem: key.serialize_pem(),
		}
	}

	pub fn authority(&self) -> Authority {
		Authority::from_pem(&self.cert_pem, &self.key_pem).unwrap()
	}

	pub fn ca_der(&self) -> tollgate::tls::CertificateDer<'static> {
		self.authority().ca_cert().clone()
	}

	/// An upstream client that trusts this CA in addition to the platform
	/// roots.
	pub fn upstream_client(&self) -> Client {
		Client::new(&[self.ca_der()]).unwrap()
	}
}

pub struct TestProxy {
	pub addr: SocketAddr,
	pub certs: CertStore,
}

impl TestProxy {
	pub async fn start(ca: &TestCa, handler: Arc<dyn ResponseHandler>) -> Self {
		let certs = CertStore::new(ca.authority());
		let proxy = Proxy::new(certs.clone(), handler);
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(proxy.serve(listener));
		TestProxy { addr, certs }
	}

	pub fn url(&self) -> String {
		format!("http://{}", self.addr)
	}

	/// A client routed through the proxy that trusts the CA's minted leaves.
	pub fn client(&self, ca: &TestCa) -> reqwest::Client {
		reqwest::Client::builder()
			.proxy(reqwest::Proxy::all(self.url()).unwrap())
			.add_root_certificate(reqwest::Certificate::from_pem(ca.cert_pem.as_bytes()).unwrap())
			.build()
			.unwrap()
	}
}

/// Serve a fixed response over TLS under a leaf for `host`, signed by the
/// test CA. Returns the bound address.
pub async fn start_tls_upstream(
	ca: &TestCa,
	host: &str,
	content_type: &'static str,
	body: &'static str,
) -> SocketAddr {
	let leaf = ca.authority().issue(host).unwrap();
	let acceptor = TlsAcceptor::from(Arc::new(leaf.server_config().unwrap()));
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				break;
			};
			let acceptor = acceptor.clone();
			tokio::spawn(async move {
				let Ok(tls) = acceptor.accept(stream).await else {
					return;
				};
				let service = service_fn(move |_req| async move {
					Ok::<_, Infallible>(
						hyper::Response::builder()
							.header("content-type", content_type)
							.body(Full::new(Bytes::from_static(body.as_bytes())))
							.unwrap(),
					)
				});
				let _ = http1::Builder::new()
					.serve_connection(TokioIo::new(tls), service)
					.await;
			});
		}
	});
	addr
}
