//! An intercepting HTTP/HTTPS forward proxy. CONNECT tunnels are terminated
//! under per-host leaf certificates signed by a locally installed CA, so the
//! plaintext of every proxied exchange can be inspected, blocked, delayed,
//! and logged by a pluggable response handler.

pub mod client;
pub mod config;
pub mod handlers;
pub mod http;
pub mod proxy;
pub mod telemetry;
pub mod tls;

pub use client::Client;
pub use config::Config;
pub use proxy::Proxy;
