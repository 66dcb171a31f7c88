use std::net::SocketAddr;
use std::path::PathBuf;

const ENV_CA_CERT: &str = "TOLLGATE_CA_CERT";
const ENV_CA_KEY: &str = "TOLLGATE_CA_KEY";
const ENV_BIND: &str = "TOLLGATE_BIND";
const ENV_DEBUG: &str = "TOLLGATE_DEBUG";
const ENV_UPSTREAM_ROOTS: &str = "TOLLGATE_UPSTREAM_ROOTS";

const DEFAULT_BIND: &str = "0.0.0.0:8000";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("{ENV_CA_CERT} and {ENV_CA_KEY} environment variables must be provided")]
	MissingCa,
	#[error("invalid listen address {0:?}")]
	BadBind(String),
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	/// PEM-encoded X.509 certificate of the signing CA.
	pub ca_cert: PathBuf,
	/// PEM-encoded PKCS#8 private key of the signing CA.
	pub ca_key: PathBuf,
	pub bind: SocketAddr,
	pub debug: bool,
	/// Optional extra PEM trust roots for the upstream client, appended to
	/// the platform store.
	pub upstream_roots: Option<PathBuf>,
}

impl Config {
	/// Assemble the configuration from the environment. The CA material is
	/// required; everything else has a default.
	pub fn from_env() -> Result<Self, ConfigError> {
		let ca_cert = std::env::var(ENV_CA_CERT).ok().map(PathBuf::from);
		let ca_key = std::env::var(ENV_CA_KEY).ok().map(PathBuf::from);
		let (Some(ca_cert), Some(ca_key)) = (ca_cert, ca_key) else {
			return Err(ConfigError::MissingCa);
		};
		let bind = std::env::var(ENV_BIND).unwrap_or_else(|_| DEFAULT_BIND.to_string());
		let bind = bind.parse().map_err(|_| ConfigError::BadBind(bind))?;
		let debug = std::env::var(ENV_DEBUG)
			.map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
			.unwrap_or(false);
		let upstream_roots = std::env::var(ENV_UPSTREAM_ROOTS).ok().map(PathBuf::from);
		Ok(Config {
			ca_cert,
			ca_key,
			bind,
			debug,
			upstream_roots,
		})
	}
}
