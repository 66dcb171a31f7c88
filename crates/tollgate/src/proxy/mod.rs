//! Top-level dispatcher: accepts connections, parses each request into an
//! envelope, routes CONNECT to the TLS bridge and everything else through
//! the response handler, and turns failures into the canonical wire pages.

mod connect;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::handlers::ResponseHandler;
use crate::http::{self, Body, Method, Request, Response, StatusCode, header};
use crate::telemetry::log::RequestLog;
use crate::tls::CertStore;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
	#[error("invalid host: {0}")]
	InvalidHost(String),
	#[error("certificate service: {0}")]
	Certificate(#[from] crate::tls::Error),
	#[error("request normalization: {0}")]
	Normalize(#[source] anyhow::Error),
	#[error("handler: {0}")]
	Handler(#[source] anyhow::Error),
}

/// Record of one request routed through the proxy. For CONNECT the record
/// covers the whole tunnel; every request re-read inside it shares the id.
#[derive(Clone, Debug)]
pub struct Envelope {
	pub id: Uuid,
	pub host: String,
	pub port: u16,
	pub client: SocketAddr,
}

impl Envelope {
	pub fn parse<B>(req: &::http::Request<B>, client: SocketAddr) -> Result<Self, ProxyError> {
		let authority = req
			.uri()
			.authority()
			.map(|a| a.as_str().to_string())
			.or_else(|| {
				req
					.headers()
					.get(header::HOST)
					.and_then(|h| h.to_str().ok())
					.map(str::to_string)
			})
			.ok_or_else(|| ProxyError::InvalidHost("no host in request".to_string()))?;
		let (host, port) = split_host_port(&authority)?;
		let port = match port {
			Some(port) => port,
			None if req.method() == Method::CONNECT => 443,
			None => 80,
		};
		Ok(Envelope {
			id: Uuid::new_v4(),
			host,
			port,
			client,
		})
	}

	pub fn id_hex(&self) -> String {
		self.id.simple().to_string()
	}
}

fn split_host_port(authority: &str) -> Result<(String, Option<u16>), ProxyError> {
	let invalid = || ProxyError::InvalidHost(authority.to_string());
	if authority.contains('@') || authority.is_empty() {
		return Err(invalid());
	}
	// Bracketed IPv6 literal.
	if let Some(rest) = authority.strip_prefix('[') {
		let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
		let port = match after.strip_prefix(':') {
			Some(p) => Some(p.parse().map_err(|_| invalid())?),
			None if after.is_empty() => None,
			None => return Err(invalid()),
		};
		return Ok((host.to_string(), port));
	}
	match authority.split_once(':') {
		Some((host, port)) => {
			if host.is_empty() || port.contains(':') {
				return Err(invalid());
			}
			Ok((host.to_string(), Some(port.parse().map_err(|_| invalid())?)))
		},
		None => Ok((authority.to_string(), None)),
	}
}

/// Rewrite a proxied request for the upstream client: absolute URI built
/// from the envelope's host/port (scheme defaults to https when the request
/// carried none, i.e. inside a tunnel), and the hop-by-hop proxy headers
/// removed.
pub(crate) fn normalize(req: &mut Request, envelope: &Envelope) -> anyhow::Result<()> {
	let host = if envelope.host.contains(':') {
		format!("[{}]", envelope.host)
	} else {
		envelope.host.clone()
	};
	let port = envelope.port;
	http::modify_req_uri(req, |parts| {
		let scheme = parts.scheme.take().unwrap_or(http::Scheme::HTTPS);
		let default_port = if scheme == http::Scheme::HTTP { 80 } else { 443 };
		let authority = if port == default_port {
			host
		} else {
			format!("{host}:{port}")
		};
		parts.authority = Some(authority.parse()?);
		if parts.path_and_query.is_none() {
			parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
		}
		parts.scheme = Some(scheme);
		Ok(())
	})?;
	req.headers_mut().remove(header::PROXY_AUTHORIZATION);
	req.headers_mut().remove(http::PROXY_CONNECTION);
	Ok(())
}

fn stamp_request_id(resp: &mut Response, envelope: &Envelope) {
	if let Ok(value) = header::HeaderValue::from_str(&envelope.id_hex()) {
		resp.headers_mut().insert(http::X_PROXY_REQUEST_ID, value);
	}
}

#[derive(Clone)]
pub struct Proxy {
	certs: CertStore,
	handler: Arc<dyn ResponseHandler>,
}

impl Proxy {
	pub fn new(certs: CertStore, handler: Arc<dyn ResponseHandler>) -> Self {
		Proxy { certs, handler }
	}

	/// Accept loop: one task per connection, each executing to completion.
	pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
		loop {
			let (stream, peer) = listener.accept().await?;
			let proxy = self.clone();
			tokio::spawn(async move { proxy.handle_connection(stream, peer).await });
		}
	}

	async fn handle_connection(self, stream: TcpStream, peer: SocketAddr) {
		let io = TokioIo::new(stream);
		let proxy = self.clone();
		let service = service_fn(move |req| {
			let proxy = proxy.clone();
			async move { Ok::<_, Infallible>(proxy.dispatch(req, peer).await) }
		});
		// with_upgrades lets CONNECT take over the raw socket once the 200
		// response is on the wire. The CONNECT reply must be the bare
		// status line, so no generated date header.
		let conn = http1::Builder::new()
			.timer(hyper_util::rt::TokioTimer::new())
			.auto_date_header(false)
			.header_read_timeout(std::time::Duration::from_secs(30))
			.serve_connection(io, service)
			.with_upgrades();
		if let Err(e) = conn.await {
			debug!(client = %peer, error = %e, "connection closed");
		}
	}

	async fn dispatch(&self, req: ::http::Request<Incoming>, peer: SocketAddr) -> Response {
		let envelope = match Envelope::parse(&req, peer) {
			Ok(envelope) => envelope,
			Err(e) => {
				warn!(client = %peer, error = %e, "malformed request");
				return page::bad_request(&e);
			},
		};
		if req.method() == Method::CONNECT {
			self.clone().dispatch_connect(req, envelope)
		} else {
			self.dispatch_http(req, envelope).await
		}
	}

	/// Plain-HTTP path: no status line is written ahead of the handler's
	/// response, so the upstream status reaches the client unmasked.
	async fn dispatch_http(&self, req: ::http::Request<Incoming>, envelope: Envelope) -> Response {
		let mut log = RequestLog::new(envelope.id_hex(), req.method().clone(), envelope.client);
		let mut req = req.map(Body::new);
		if let Err(e) = normalize(&mut req, &envelope) {
			let err = ProxyError::Normalize(e);
			log.error = Some(err.to_string());
			return page::bad_request(&err);
		}
		log.target = Some(req.uri().to_string());
		match self.handler.handle(req, envelope.client).await {
			Ok(mut resp) => {
				log.status = Some(resp.status().as_u16());
				stamp_request_id(&mut resp, &envelope);
				resp
			},
			Err(e) => {
				log.error = Some(ProxyError::Handler(e).to_string());
				page::bad_gateway(&envelope.id_hex())
			},
		}
	}

	/// CONNECT path: reply `200 OK` and move the rest of the exchange onto
	/// the taken-over socket.
	fn dispatch_connect(self, req: ::http::Request<Incoming>, envelope: Envelope) -> Response {
		tokio::spawn(async move {
			match hyper::upgrade::on(req).await {
				Ok(upgraded) => connect::tunnel(self, upgraded, envelope).await,
				Err(e) => {
					warn!(request_id = %envelope.id_hex(), error = %e, "connection takeover failed")
				},
			}
		});
		::http::Response::builder()
			.status(StatusCode::OK)
			.body(Body::empty())
			.expect("static response")
	}

	/// One plaintext request re-read from inside an established tunnel.
	pub(crate) async fn handle_tunneled(
		&self,
		req: ::http::Request<Incoming>,
		envelope: &Envelope,
	) -> Response {
		let mut log = RequestLog::new(envelope.id_hex(), req.method().clone(), envelope.client);
		let mut req = req.map(Body::new);
		if let Err(e) = normalize(&mut req, envelope) {
			log.error = Some(e.to_string());
			return page::internal_error(&envelope.id_hex());
		}
		log.target = Some(req.uri().to_string());
		match self.handler.handle(req, envelope.client).await {
			Ok(mut resp) => {
				log.status = Some(resp.status().as_u16());
				stamp_request_id(&mut resp, envelope);
				resp
			},
			Err(e) => {
				log.error = Some(ProxyError::Handler(e).to_string());
				page::internal_error(&envelope.id_hex())
			},
		}
	}
}

pub(crate) mod page {
	use super::*;

	fn internal_error_body(id: &str) -> String {
		format!("<h1>Internal Server Error</h1> <p>Request ID: {id}</p>")
	}

	/// The canonical error page as raw wire bytes, for failures that happen
	/// after takeover but outside any HTTP machinery.
	pub fn internal_error_bytes(id: &str) -> Vec<u8> {
		let body = internal_error_body(id);
		format!(
			"HTTP/1.1 500 Internal Server Error\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
			body.len(),
			body
		)
		.into_bytes()
	}

	pub fn internal_error(id: &str) -> Response {
		::http::Response::builder()
			.status(StatusCode::INTERNAL_SERVER_ERROR)
			.header(header::CONTENT_TYPE, "text/html")
			.body(Body::from(internal_error_body(id)))
			.expect("static response")
	}

	pub fn bad_request(err: &ProxyError) -> Response {
		::http::Response::builder()
			.status(StatusCode::BAD_REQUEST)
			.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
			.body(Body::from(format!("Malformed request: {err}.")))
			.expect("static response")
	}

	pub fn bad_gateway(id: &str) -> Response {
		::http::Response::builder()
			.status(StatusCode::BAD_GATEWAY)
			.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
			.body(Body::from(format!(
				"Bad Gateway: the upstream request failed. Request ID: {id}."
			)))
			.expect("static response")
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;

	fn connect_req(target: &str) -> ::http::Request<()> {
		::http::Request::builder()
			.method(Method::CONNECT)
			.uri(target)
			.body(())
			.unwrap()
	}

	fn get_req(uri: &str, host: Option<&str>) -> ::http::Request<()> {
		let mut builder = ::http::Request::builder().method(Method::GET).uri(uri);
		if let Some(host) = host {
			builder = builder.header(header::HOST, host);
		}
		builder.body(()).unwrap()
	}

	fn peer() -> SocketAddr {
		"198.51.100.4:40112".parse().unwrap()
	}

	#[test]
	fn connect_defaults_to_port_443() {
		let envelope = Envelope::parse(&connect_req("example.com"), peer()).unwrap();
		assert_eq!(envelope.host, "example.com");
		assert_eq!(envelope.port, 443);
	}

	#[test]
	fn connect_keeps_an_explicit_port() {
		let envelope = Envelope::parse(&connect_req("example.com:8443"), peer()).unwrap();
		assert_eq!(envelope.port, 8443);
	}

	#[test]
	fn plain_requests_default_to_port_80() {
		let envelope = Envelope::parse(&get_req("/index.html", Some("example.com")), peer()).unwrap();
		assert_eq!(envelope.host, "example.com");
		assert_eq!(envelope.port, 80);
	}

	#[test]
	fn absolute_form_uses_the_uri_authority() {
		let envelope = Envelope::parse(&get_req("http://example.com:8080/x", None), peer()).unwrap();
		assert_eq!(envelope.host, "example.com");
		assert_eq!(envelope.port, 8080);
	}

	#[test]
	fn bracketed_ipv6_hosts_parse() {
		let envelope = Envelope::parse(&connect_req("[2001:db8::1]:8443"), peer()).unwrap();
		assert_eq!(envelope.host, "2001:db8::1");
		assert_eq!(envelope.port, 8443);
	}

	#[test]
	fn missing_host_is_rejected() {
		let err = Envelope::parse(&get_req("/index.html", None), peer()).unwrap_err();
		assert_matches!(err, ProxyError::InvalidHost(_));
	}

	#[rstest::rstest]
	#[case("example.com:http")]
	#[case("example.com:70000")]
	#[case("user@example.com")]
	#[case(":8080")]
	#[case("")]
	fn bad_authorities_are_rejected(#[case] authority: &str) {
		assert_matches!(split_host_port(authority), Err(ProxyError::InvalidHost(_)));
	}

	#[test]
	fn ids_are_128_bit_hex() {
		let envelope = Envelope::parse(&connect_req("example.com"), peer()).unwrap();
		let id = envelope.id_hex();
		assert_eq!(id.len(), 32);
		assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
	}

	fn normalized(uri: &str, envelope: &Envelope) -> Request {
		let mut req = ::http::Request::builder()
			.uri(uri)
			.header(header::PROXY_AUTHORIZATION, "Basic abc")
			.header(http::PROXY_CONNECTION, "keep-alive")
			.header(header::USER_AGENT, "test-agent")
			.body(Body::empty())
			.unwrap();
		normalize(&mut req, envelope).unwrap();
		req
	}

	#[test]
	fn tunneled_requests_become_absolute_https() {
		let envelope = Envelope::parse(&connect_req("example.com"), peer()).unwrap();
		let req = normalized("/watch?v=abc", &envelope);
		assert_eq!(req.uri().to_string(), "https://example.com/watch?v=abc");
	}

	#[test]
	fn nonstandard_ports_stay_in_the_authority() {
		let envelope = Envelope::parse(&connect_req("example.com:8443"), peer()).unwrap();
		let req = normalized("/", &envelope);
		assert_eq!(req.uri().to_string(), "https://example.com:8443/");
	}

	#[test]
	fn plain_requests_keep_their_scheme_and_port() {
		let envelope = Envelope::parse(&get_req("http://example.com/a", None), peer()).unwrap();
		let req = normalized("http://example.com/a", &envelope);
		assert_eq!(req.uri().to_string(), "http://example.com/a");
	}

	#[test]
	fn proxy_headers_are_scrubbed() {
		let envelope = Envelope::parse(&connect_req("example.com"), peer()).unwrap();
		let req = normalized("/", &envelope);
		assert!(req.headers().get(header::PROXY_AUTHORIZATION).is_none());
		assert!(req.headers().get(http::PROXY_CONNECTION).is_none());
		assert_eq!(req.headers().get(header::USER_AGENT).unwrap(), "test-agent");
	}

	#[test]
	fn error_page_bytes_are_canonical() {
		let bytes = page::internal_error_bytes("deadbeef");
		let text = String::from_utf8(bytes).unwrap();
		let body = "<h1>Internal Server Error</h1> <p>Request ID: deadbeef</p>";
		assert_eq!(
			text,
			format!(
				"HTTP/1.1 500 Internal Server Error\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
				body.len(),
				body
			)
		);
	}
}
