//! HTTP type aliases and request-editing helpers shared across the proxy.

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub use ::http::uri::{Authority, Scheme};
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};

/// Stamped onto every proxied response so the client (and the request log)
/// can correlate a response with a proxy request record.
pub const X_PROXY_REQUEST_ID: HeaderName = HeaderName::from_static("x-proxyrequest-id");

/// Hop-by-hop proxy headers that must never reach the upstream.
pub const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

pub fn modify_req_uri(
	req: &mut Request,
	f: impl FnOnce(&mut uri::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let nreq = std::mem::take(req);
	let (mut head, body) = nreq.into_parts();
	let mut parts = head.uri.into_parts();
	f(&mut parts)?;
	head.uri = Uri::from_parts(parts)?;
	*req = Request::from_parts(head, body);
	Ok(())
}

/// Collect an entire body into memory. Intended for synthetic and test
/// bodies; proxied bodies stream and never pass through here.
pub async fn read_body(body: Body) -> Result<bytes::Bytes, Error> {
	use http_body_util::BodyExt;
	Ok(body.collect().await?.to_bytes())
}
