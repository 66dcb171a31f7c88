//! Pluggable policy stage: given a normalized upstream-bound request and the
//! client's address, produce the response the client will receive.

pub mod delay;

use std::net::SocketAddr;

use crate::client::Client;
use crate::http::{Request, Response};

pub use delay::BlockDelayHandler;

#[async_trait::async_trait]
pub trait ResponseHandler: Send + Sync + 'static {
	async fn handle(&self, req: Request, client: SocketAddr) -> anyhow::Result<Response>;
}

/// Pass-through: forward the request and return the upstream response
/// unchanged.
pub struct DefaultHandler {
	client: Client,
}

impl DefaultHandler {
	pub fn new(client: Client) -> Self {
		DefaultHandler { client }
	}
}

#[async_trait::async_trait]
impl ResponseHandler for DefaultHandler {
	async fn handle(&self, req: Request, _client: SocketAddr) -> anyhow::Result<Response> {
		Ok(self.client.request(req).await?)
	}
}
