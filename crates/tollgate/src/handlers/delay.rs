//! Block-and-delay policy: hard-blocks matching URLs and imposes a one-time
//! human delay on designated hosts, with a per-client grace period once the
//! delay has been served.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tracing::debug;
use url::Url;

use super::ResponseHandler;
use crate::client::Client;
use crate::http::{Body, Request, Response, StatusCode, header};

#[cfg(test)]
#[path = "delay_tests.rs"]
mod tests;

/// How long the delay page makes the client wait before redirecting.
pub const DELAY_TIME: Duration = Duration::from_secs(3 * 60);
/// How long a served delay exempts the (client, host) pair from another one.
pub const GRACE_PERIOD: Duration = Duration::from_secs(30 * 60);

const DELAY_QUERY_KEY: &str = "delay-id";

/// Compiled rule lists. Swapped wholesale so a hot reload never observes a
/// half-updated configuration.
pub struct Rules {
	/// Hostnames that get the human delay treatment.
	pub delayed_hosts: Vec<regex::Regex>,
	/// Matched against the request URL without its query; a hit is refused
	/// outright.
	pub blocked_urls: Vec<regex::Regex>,
}

impl Rules {
	pub fn compile(delayed: &[&str], blocked: &[&str]) -> Result<Self, regex::Error> {
		Ok(Rules {
			delayed_hosts: delayed
				.iter()
				.map(|p| regex::Regex::new(p))
				.collect::<Result<_, _>>()?,
			blocked_urls: blocked
				.iter()
				.map(|p| regex::Regex::new(p))
				.collect::<Result<_, _>>()?,
		})
	}
}

impl Default for Rules {
	fn default() -> Self {
		Rules::compile(
			&[
				r"^(www\.)?youtube\.com$",
				r"^m\.youtube\.com$",
				r"^(www\.)?instagram\.com$",
			],
			&[],
		)
		.expect("default patterns compile")
	}
}

struct DelayedAccess {
	hostname: String,
	at: SystemTime,
}

struct PendingDelay {
	hostname: String,
	response: Response,
}

#[derive(Default)]
struct State {
	last_access: HashMap<IpAddr, Vec<DelayedAccess>>,
	pending: HashMap<String, PendingDelay>,
}

pub struct BlockDelayHandler {
	client: Client,
	rules: ArcSwap<Rules>,
	state: Mutex<State>,
}

impl BlockDelayHandler {
	pub fn new(client: Client) -> Self {
		Self::with_rules(client, Rules::default())
	}

	pub fn with_rules(client: Client, rules: Rules) -> Self {
		BlockDelayHandler {
			client,
			rules: ArcSwap::from_pointee(rules),
			state: Mutex::new(State::default()),
		}
	}

	/// Replace the rule lists atomically.
	pub fn set_rules(&self, rules: Rules) {
		self.rules.store(Arc::new(rules));
	}

	fn redeem(&self, delay_id: &str, hostname: &str) -> Option<Response> {
		let mut state = self.state.lock();
		if state.pending.get(delay_id)?.hostname != hostname {
			return None;
		}
		state.pending.remove(delay_id).map(|p| p.response)
	}

	/// Record (or refresh) the grace window for a (client, host) pair.
	fn touch_grace(&self, client_ip: IpAddr, hostname: &str) {
		let mut state = self.state.lock();
		let accesses = state.last_access.entry(client_ip).or_default();
		match accesses.iter_mut().find(|a| a.hostname == hostname) {
			Some(access) => access.at = SystemTime::now(),
			None => accesses.push(DelayedAccess {
				hostname: hostname.to_string(),
				at: SystemTime::now(),
			}),
		}
	}

	fn within_grace(&self, client_ip: IpAddr, hostname: &str) -> bool {
		let state = self.state.lock();
		let Some(accesses) = state.last_access.get(&client_ip) else {
			return false;
		};
		accesses.iter().any(|a| {
			a.hostname == hostname
				&& SystemTime::now()
					.duration_since(a.at)
					.unwrap_or_default()
					<= GRACE_PERIOD
		})
	}

	fn impose_delay(
		&self,
		url: &Url,
		hostname: &str,
		client: SocketAddr,
		upstream: Response,
	) -> Response {
		let delay_id = delay_id(url, client);
		let mut delayed_url = url.clone();
		delayed_url
			.query_pairs_mut()
			.append_pair(DELAY_QUERY_KEY, &delay_id);
		let page = delay_page(delayed_url.as_str());

		self.touch_grace(client.ip(), hostname);
		self.state.lock().pending.insert(
			delay_id,
			PendingDelay {
				hostname: hostname.to_string(),
				response: upstream,
			},
		);
		page
	}
}

#[async_trait::async_trait]
impl ResponseHandler for BlockDelayHandler {
	async fn handle(&self, req: Request, client: SocketAddr) -> anyhow::Result<Response> {
		let url = Url::parse(&req.uri().to_string())?;
		let hostname = url.host_str().unwrap_or_default().to_string();

		// A delay page redirect coming back around: hand over the stashed
		// upstream response. Each id redeems exactly once.
		let delay_id = url
			.query_pairs()
			.find(|(k, _)| k == DELAY_QUERY_KEY)
			.map(|(_, v)| v.into_owned());
		if let Some(id) = delay_id
			&& let Some(stashed) = self.redeem(&id, &hostname)
		{
			debug!(host = %hostname, "redeemed delayed response");
			// Redeeming restarts the grace window: the wait was served in
			// full, so the clock runs from now rather than from the delay
			// page.
			self.touch_grace(client.ip(), &hostname);
			return Ok(stashed);
		}

		// Hard blocks are decided before any upstream contact.
		let rules = self.rules.load_full();
		let target = {
			let mut u = url.clone();
			u.set_query(None);
			u.set_fragment(None);
			u.to_string()
		};
		if rules.blocked_urls.iter().any(|re| re.is_match(&target)) {
			debug!(url = %target, "refused blocked url");
			return Ok(blocked_page());
		}

		let resp = self.client.request(req).await?;

		if !rules.delayed_hosts.iter().any(|re| re.is_match(&hostname)) {
			return Ok(resp);
		}
		// Only delay top-level documents, not subresources.
		let is_html = resp
			.headers()
			.get(header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.is_some_and(|v| v.contains("text/html"));
		if !is_html {
			return Ok(resp);
		}
		if self.within_grace(client.ip(), &hostname) {
			return Ok(resp);
		}

		debug!(host = %hostname, "serving delay page");
		Ok(self.impose_delay(&url, &hostname, client, resp))
	}
}

/// Single-use token tying a delay page to its stashed response.
fn delay_id(url: &Url, client: SocketAddr) -> String {
	let mut hasher = Sha1::new();
	hasher.update(url.as_str().as_bytes());
	hasher.update(chrono::Utc::now().to_rfc3339().as_bytes());
	hasher.update(client.to_string().as_bytes());
	hex::encode(hasher.finalize())
}

fn blocked_page() -> Response {
	let body = "<h1>Request Blocked</h1>\r\n<pre>This request has been blocked by the proxy.</pre>\r\n";
	::http::Response::builder()
		.status(StatusCode::FORBIDDEN)
		.header(header::CONTENT_TYPE, "text/html; charset=UTF-8")
		.body(Body::from(body))
		.expect("static response")
}

fn delay_page(href: &str) -> Response {
	let delay_ms = DELAY_TIME.as_millis();
	let delay_min = DELAY_TIME.as_secs() / 60;
	let grace_min = GRACE_PERIOD.as_secs() / 60;
	let body = format!(
		r#"<!DOCTYPE html>
<html lang="en">
	<head>
		<meta charset="UTF-8">
		<meta name="viewport" content="width=device-width, initial-scale=1.0">
		<title>Delayed Request</title>
		<script>
			setTimeout(() => {{
				window.location.href = "{href}";
			}}, {delay_ms});
		</script>
	</head>
	<body>
		<h1>Delayed Request</h1>
		<pre>This request has been delayed for {delay_min} minutes. Once you finish waiting, you will be granted access for {grace_min} minutes.</pre>
	</body>
</html>
"#
	);
	::http::Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "text/html")
		.body(Body::from(body))
		.expect("static response")
}
