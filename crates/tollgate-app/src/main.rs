use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tollgate::config::Config;
use tollgate::handlers::BlockDelayHandler;
use tollgate::tls::{Authority, CertStore};
use tollgate::{Client, Proxy};
use tracing::info;

#[derive(Parser)]
#[command(name = "tollgate", about = "Intercepting HTTP/HTTPS forward proxy")]
struct Args {
	/// Path to the CA certificate PEM; overrides TOLLGATE_CA_CERT.
	#[arg(long)]
	ca_cert: Option<PathBuf>,
	/// Path to the CA private key PEM; overrides TOLLGATE_CA_KEY.
	#[arg(long)]
	ca_key: Option<PathBuf>,
	/// Listen address; overrides TOLLGATE_BIND.
	#[arg(long)]
	bind: Option<SocketAddr>,
	/// Raise log verbosity; overrides TOLLGATE_DEBUG.
	#[arg(long)]
	debug: bool,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
	let mut config = match (&args.ca_cert, &args.ca_key) {
		(Some(ca_cert), Some(ca_key)) => Config {
			ca_cert: ca_cert.clone(),
			ca_key: ca_key.clone(),
			bind: "0.0.0.0:8000".parse().expect("static address"),
			debug: false,
			upstream_roots: None,
		},
		_ => Config::from_env()?,
	};
	if let Some(bind) = args.bind {
		config.bind = bind;
	}
	config.debug |= args.debug;
	Ok(config)
}

fn extra_roots(
	config: &Config,
) -> anyhow::Result<Vec<tollgate::tls::CertificateDer<'static>>> {
	let Some(path) = &config.upstream_roots else {
		return Ok(Vec::new());
	};
	let pem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
	let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut pem.as_slice()).collect();
	Ok(certs.with_context(|| format!("parsing {}", path.display()))?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let config = load_config(&args)?;
	tollgate_core::telemetry::setup_logging(config.debug);
	tracing::debug!(config = ?config, "effective configuration");

	let authority =
		Authority::load(&config.ca_cert, &config.ca_key).context("loading CA material")?;
	let certs = CertStore::new(authority);
	let client = Client::new(&extra_roots(&config)?).context("building upstream client")?;
	let handler = Arc::new(BlockDelayHandler::new(client));
	let proxy = Proxy::new(certs, handler);

	let listener = tokio::net::TcpListener::bind(config.bind)
		.await
		.with_context(|| format!("binding {}", config.bind))?;
	info!(addr = %config.bind, "proxy listening");

	tokio::select! {
		result = proxy.serve(listener) => result.context("accept loop"),
		_ = tokio::signal::ctrl_c() => {
			info!("shutting down");
			Ok(())
		},
	}
}
