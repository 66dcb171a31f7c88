//! Interception certificates: the signing CA is loaded once at startup and
//! short-lived leaf certificates are minted per intercepted host, signed by
//! that CA. Clients that trust the CA trust the proxied TLS session.

mod store;

use std::io::Cursor;
use std::sync::Arc;

use rand::RngExt;
use rustls::ServerConfig;
use rustls::crypto::aws_lc_rs;
use rustls_pemfile::Item;
pub use rustls_pki_types::CertificateDer;
use rustls_pki_types::PrivateKeyDer;

pub use store::{CertPersist, CertStore, PersistedCert};

/// Leaves are valid from `now - VALIDITY` to `now + VALIDITY`. Backdating
/// keeps clients with modest clock skew from rejecting a fresh leaf.
pub const VALIDITY: time::Duration = time::Duration::hours(7200);

#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
	#[error("ca material: {0}")]
	CaParse(String),
	#[error("certificate generation: {0}")]
	Generate(Arc<rcgen::Error>),
	#[error("certificate parse: {0}")]
	CertificateParse(String),
	#[error("rustls: {0}")]
	Rustls(#[from] rustls::Error),
	#[error("signing task terminated")]
	SigningTask,
}

impl From<rcgen::Error> for Error {
	fn from(e: rcgen::Error) -> Self {
		Error::Generate(Arc::new(e))
	}
}

/// The CA keypair, parsed once at startup and immutable afterwards.
pub struct Authority {
	issuer: rcgen::Issuer<'static, rcgen::KeyPair>,
	ca_cert: CertificateDer<'static>,
}

impl std::fmt::Debug for Authority {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Authority").finish_non_exhaustive()
	}
}

impl Authority {
	/// Read and parse the CA certificate (PEM X.509) and private key
	/// (PEM PKCS#8 or SEC1). Startup fails if either is unreadable.
	pub fn load(cert_path: &std::path::Path, key_path: &std::path::Path) -> Result<Self, Error> {
		let cert_pem = std::fs::read_to_string(cert_path)
			.map_err(|e| Error::CaParse(format!("reading {}: {e}", cert_path.display())))?;
		let key_pem = std::fs::read_to_string(key_path)
			.map_err(|e| Error::CaParse(format!("reading {}: {e}", key_path.display())))?;
		Self::from_pem(&cert_pem, &key_pem)
	}

	pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, Error> {
		let key = rcgen::KeyPair::from_pem(key_pem).map_err(|e| Error::CaParse(e.to_string()))?;
		let issuer = rcgen::Issuer::from_ca_cert_pem(cert_pem, key)
			.map_err(|e| Error::CaParse(e.to_string()))?;
		let ca_cert = parse_cert(cert_pem.as_bytes())?;
		Ok(Authority { issuer, ca_cert })
	}

	/// The CA certificate itself, e.g. for building trust stores.
	pub fn ca_cert(&self) -> &CertificateDer<'static> {
		&self.ca_cert
	}

	/// Mint a leaf certificate for `host`: fresh ECDSA P-256 key, random
	/// 128-bit serial, SAN limited to the host, signed by the CA.
	pub fn issue(&self, host: &str) -> Result<IssuedCert, Error> {
		let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

		let mut params = rcgen::CertificateParams::new(vec![host.to_string()])?;
		let mut dn = rcgen::DistinguishedName::new();
		dn.push(rcgen::DnType::CountryName, "US");
		dn.push(rcgen::DnType::OrganizationName, "N/A");
		params.distinguished_name = dn;

		let serial: [u8; 16] = rand::rng().random();
		params.serial_number = Some(rcgen::SerialNumber::from(serial.to_vec()));

		let now = time::OffsetDateTime::now_utc();
		params.not_before = now - VALIDITY;
		params.not_after = now + VALIDITY;

		params.key_usages = vec![rcgen::KeyUsagePurpose::DigitalSignature];
		params.extended_key_usages = vec![
			rcgen::ExtendedKeyUsagePurpose::ServerAuth,
			rcgen::ExtendedKeyUsagePurpose::ClientAuth,
		];
		params.is_ca = rcgen::IsCa::ExplicitNoCa;

		let cert = params.signed_by(&key, &self.issuer)?;
		Ok(IssuedCert {
			chain: vec![cert.der().clone()],
			cert_pem: cert.pem(),
			key_pem: key.serialize_pem(),
			key: PrivateKeyDer::Pkcs8(key.serialize_der().into()),
		})
	}
}

/// A minted leaf keypair, ready to terminate one host's proxied sessions.
pub struct IssuedCert {
	chain: Vec<CertificateDer<'static>>,
	key: PrivateKeyDer<'static>,
	cert_pem: String,
	key_pem: String,
}

impl std::fmt::Debug for IssuedCert {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("IssuedCert")
			.field("chain_len", &self.chain.len())
			.finish_non_exhaustive()
	}
}

impl IssuedCert {
	/// Rebuild an entry from its persisted PEM form. The key may use either
	/// the PKCS#8 or the SEC1 (`EC PRIVATE KEY`) encoding.
	pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, Error> {
		let cert = parse_cert(cert_pem.as_bytes())?;
		let key = parse_key(key_pem.as_bytes())?;
		Ok(IssuedCert {
			chain: vec![cert],
			key,
			cert_pem: cert_pem.to_string(),
			key_pem: key_pem.to_string(),
		})
	}

	pub fn chain(&self) -> &[CertificateDer<'static>] {
		&self.chain
	}

	pub fn cert_pem(&self) -> &str {
		&self.cert_pem
	}

	pub fn key_pem(&self) -> &str {
		&self.key_pem
	}

	/// Server-side TLS configuration for terminating a proxied session under
	/// this leaf: TLS 1.2/1.3, X25519 and P-256 preferred, server cipher
	/// order. The protocol floor is 1.2 because rustls implements nothing
	/// older.
	pub fn server_config(&self) -> Result<ServerConfig, Error> {
		let mut provider = aws_lc_rs::default_provider();
		provider.kx_groups = vec![aws_lc_rs::kx_group::X25519, aws_lc_rs::kx_group::SECP256R1];
		let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
			.with_protocol_versions(rustls::ALL_VERSIONS)?
			.with_no_client_auth()
			.with_single_cert(self.chain.clone(), self.key.clone_key())?;
		config.ignore_client_order = true;
		config.alpn_protocols = vec![b"http/1.1".to_vec()];
		Ok(config)
	}
}

fn parse_key(mut key: &[u8]) -> Result<PrivateKeyDer<'static>, Error> {
	let mut reader = std::io::BufReader::new(Cursor::new(&mut key));
	let parsed = rustls_pemfile::read_one(&mut reader)
		.map_err(|e| Error::CertificateParse(e.to_string()))?
		.ok_or_else(|| Error::CertificateParse("no key".to_string()))?;
	match parsed {
		Item::Pkcs8Key(k) => Ok(PrivateKeyDer::Pkcs8(k)),
		Item::Sec1Key(k) => Ok(PrivateKeyDer::Sec1(k)),
		_ => Err(Error::CertificateParse("no key".to_string())),
	}
}

fn parse_cert(mut cert: &[u8]) -> Result<CertificateDer<'static>, Error> {
	let mut reader = std::io::BufReader::new(Cursor::new(&mut cert));
	let parsed = rustls_pemfile::read_one(&mut reader)
		.map_err(|e| Error::CertificateParse(e.to_string()))?
		.ok_or_else(|| Error::CertificateParse("no certificate".to_string()))?;
	let Item::X509Certificate(der) = parsed else {
		return Err(Error::CertificateParse("no certificate".to_string()));
	};
	Ok(der)
}


#[cfg(test)]
mod tests {
	use x509_parser::prelude::*;

	use super::testutil::test_authority;
	use super::*;

	#[test]
	fn issued_leaf_matches_template() {
		let (authority, _ca_pem) = test_authority();
		let leaf = authority.issue("example.com").unwrap();

		let (_, cert) = X509Certificate::from_der(leaf.chain()[0].as_ref()).unwrap();
		let sans: Vec<String> = cert
			.subject_alternative_name()
			.unwrap()
			.unwrap()
			.value
			.general_names
			.iter()
			.filter_map(|n| match n {
				GeneralName::DNSName(d) => Some(d.to_string()),
				_ => None,
			})
			.collect();
		assert_eq!(sans, vec!["example.com".to_string()]);

		assert!(cert.validity().is_valid());
		// Backdated by VALIDITY, not issued at `now`.
		let now = chrono::Utc::now().timestamp();
		assert!(cert.validity().not_before.timestamp() < now - 3600);
		assert!(cert.validity().not_after.timestamp() > now + 3600);

		assert!(!cert.is_ca());
		let ku = cert.key_usage().unwrap().unwrap();
		assert!(ku.value.digital_signature());
		let eku = cert.extended_key_usage().unwrap().unwrap();
		assert!(eku.value.server_auth);
		assert!(eku.value.client_auth);
	}

	#[test]
	fn issued_leaf_is_signed_by_the_ca() {
		let (authority, ca_pem) = test_authority();
		let leaf = authority.issue("example.com").unwrap();

		let ca_der = crate::tls::parse_cert(ca_pem.as_bytes()).unwrap();
		let (_, ca) = X509Certificate::from_der(ca_der.as_ref()).unwrap();
		let (_, cert) = X509Certificate::from_der(leaf.chain()[0].as_ref()).unwrap();

		assert_eq!(cert.issuer(), ca.subject());
		cert.verify_signature(Some(ca.public_key())).unwrap();
	}

	#[test]
	fn serials_are_random_per_leaf() {
		let (authority, _) = test_authority();
		let a = authority.issue("example.com").unwrap();
		let b = authority.issue("example.com").unwrap();
		let serial = |c: &IssuedCert| {
			let (_, cert) = X509Certificate::from_der(c.chain()[0].as_ref()).unwrap();
			cert.raw_serial().to_vec()
		};
		assert_ne!(serial(&a), serial(&b));
	}

	#[test]
	fn pem_round_trip_preserves_the_entry() {
		let (authority, _) = test_authority();
		let leaf = authority.issue("example.com").unwrap();
		let restored = IssuedCert::from_pem(leaf.cert_pem(), leaf.key_pem()).unwrap();
		assert_eq!(restored.chain(), leaf.chain());
		restored.server_config().unwrap();
	}

	#[test]
	fn missing_ca_material_fails_load() {
		let err = Authority::load(
			std::path::Path::new("/does/not/exist.crt"),
			std::path::Path::new("/does/not/exist.key"),
		)
		.unwrap_err();
		assert!(matches!(err, Error::CaParse(_)));
	}
}
