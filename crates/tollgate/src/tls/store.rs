use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tollgate_core::singleflight;
use tracing::{debug, warn};

use super::{Authority, Error, IssuedCert};

/// TTL hint for externally persisted leaves; the in-memory cache itself has
/// no TTL (entries live for the process lifetime).
pub const PERSIST_TTL: Duration = Duration::from_secs(7200 * 3600);

/// Serialized form of a leaf entry for an external store.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PersistedCert {
	pub cert: String,
	pub key: String,
}

/// Optional external key-value persistence for leaf entries. Absence of a
/// store is not an error; the in-memory cache is sufficient on its own.
#[async_trait::async_trait]
pub trait CertPersist: Send + Sync + 'static {
	async fn load(&self, host: &str) -> Option<PersistedCert>;
	/// Store an entry with a best-effort expiry. Failures are the
	/// implementation's to log; the proxy never depends on the write.
	async fn store(&self, host: &str, cert: &PersistedCert, ttl: Duration);
}

/// Per-host leaf cache with single-flight issuance: concurrent `get` calls
/// for the same host share one signing, and a host is signed at most once
/// for the cache's lifetime.
#[derive(Clone)]
pub struct CertStore {
	inner: Arc<Inner>,
}

struct Inner {
	authority: Authority,
	cache: RwLock<HashMap<String, Arc<IssuedCert>>>,
	flights: singleflight::Group<String, Result<Arc<IssuedCert>, Error>>,
	persist: Option<Arc<dyn CertPersist>>,
	issued: AtomicUsize,
}

impl std::fmt::Debug for CertStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CertStore")
			.field("cached", &self.inner.cache.read().len())
			.finish_non_exhaustive()
	}
}

impl CertStore {
	pub fn new(authority: Authority) -> Self {
		CertStore {
			inner: Arc::new(Inner {
				authority,
				cache: RwLock::new(HashMap::new()),
				flights: singleflight::Group::new(),
				persist: None,
				issued: AtomicUsize::new(0),
			}),
		}
	}

	pub fn with_persist(authority: Authority, persist: Arc<dyn CertPersist>) -> Self {
		let mut store = Self::new(authority);
		Arc::get_mut(&mut store.inner)
			.expect("store was just created")
			.persist = Some(persist);
		store
	}

	/// Fetch the leaf for `host`, minting it on first use. Concurrent misses
	/// for the same host coalesce into a single signing.
	pub async fn get(&self, host: &str) -> Result<Arc<IssuedCert>, Error> {
		if let Some(hit) = self.inner.cache.read().get(host) {
			return Ok(hit.clone());
		}
		let inner = self.inner.clone();
		let key = host.to_string();
		let host = key.clone();
		self
			.inner
			.flights
			.work(key, async move { inner.issue_and_cache(&host).await })
			.await
			.map_err(|_| Error::SigningTask)?
	}

	/// Number of leaves actually minted (cache misses that reached the
	/// issuer). Exposed for introspection and tests.
	pub fn issued(&self) -> usize {
		self.inner.issued.load(Ordering::Relaxed)
	}
}

impl Inner {
	async fn issue_and_cache(&self, host: &str) -> Result<Arc<IssuedCert>, Error> {
		// A previous flight may have landed between the caller's miss and
		// this execution.
		if let Some(hit) = self.cache.read().get(host) {
			return Ok(hit.clone());
		}
		let entry = match self.load_persisted(host).await {
			Some(entry) => entry,
			None => {
				let entry = Arc::new(self.authority.issue(host)?);
				self.issued.fetch_add(1, Ordering::Relaxed);
				debug!(host, "minted interception leaf");
				self.store_persisted(host, &entry).await;
				entry
			},
		};
		self.cache.write().insert(host.to_string(), entry.clone());
		Ok(entry)
	}

	async fn load_persisted(&self, host: &str) -> Option<Arc<IssuedCert>> {
		let persist = self.persist.as_ref()?;
		let persisted = persist.load(host).await?;
		match IssuedCert::from_pem(&persisted.cert, &persisted.key) {
			Ok(entry) => {
				debug!(host, "loaded interception leaf from external store");
				Some(Arc::new(entry))
			},
			Err(e) => {
				warn!(host, error = %e, "discarding unparseable persisted leaf");
				None
			},
		}
	}

	async fn store_persisted(&self, host: &str, entry: &IssuedCert) {
		let Some(persist) = self.persist.as_ref() else {
			return;
		};
		let persisted = PersistedCert {
			cert: entry.cert_pem().to_string(),
			key: entry.key_pem().to_string(),
		};
		persist.store(host, &persisted, PERSIST_TTL).await;
	}
}
