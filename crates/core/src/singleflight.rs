//! Duplicate call suppression for async work, in the style of Go's
//! singleflight package: concurrent callers asking for the same key share
//! the result of a single execution.
//!
//! The execution runs on a detached task, so dropping a waiter never cancels
//! the shared work and peers still receive its result.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

type Registry<K, V> = Arc<Mutex<HashMap<K, watch::Receiver<Option<V>>>>>;

pub struct Group<K, V> {
	inflight: Registry<K, V>,
}

impl<K, V> Default for Group<K, V> {
	fn default() -> Self {
		Self {
			inflight: Arc::new(Mutex::new(HashMap::new())),
		}
	}
}

impl<K, V> std::fmt::Debug for Group<K, V> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Group").finish_non_exhaustive()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("shared execution terminated without producing a result")]
pub struct LeaderLost;

/// Removes the key from the registry when the execution finishes, including
/// the unwind path, so a panicking execution cannot wedge its key forever.
struct Deregister<K: Eq + Hash, V> {
	inflight: Registry<K, V>,
	key: Option<K>,
}

impl<K: Eq + Hash, V> Deregister<K, V> {
	fn run(&mut self) {
		if let Some(key) = self.key.take() {
			self.inflight.lock().remove(&key);
		}
	}
}

impl<K: Eq + Hash, V> Drop for Deregister<K, V> {
	fn drop(&mut self) {
		self.run();
	}
}

impl<K, V> Group<K, V>
where
	K: Eq + Hash + Clone + Send + 'static,
	V: Clone + Send + Sync + 'static,
{
	pub fn new() -> Self {
		Self::default()
	}

	/// Run `work` under `key`, or join an execution already in flight for the
	/// same key. Every caller receives a clone of the single result.
	///
	/// `LeaderLost` is only returned when the executing task dies without a
	/// result (a panic inside `work`).
	pub async fn work<F>(&self, key: K, work: F) -> Result<V, LeaderLost>
	where
		F: Future<Output = V> + Send + 'static,
	{
		let mut rx = {
			let mut inflight = self.inflight.lock();
			match inflight.get(&key) {
				Some(rx) => rx.clone(),
				None => {
					let (tx, rx) = watch::channel(None);
					inflight.insert(key.clone(), rx.clone());
					let mut dereg = Deregister {
						inflight: Arc::clone(&self.inflight),
						key: Some(key),
					};
					tokio::spawn(async move {
						let value = work.await;
						// Deregister before publishing: a caller arriving in
						// between starts a fresh execution instead of joining
						// a finished one.
						dereg.run();
						let _ = tx.send(Some(value));
					});
					rx
				},
			}
		};
		loop {
			let current = rx.borrow_and_update().clone();
			if let Some(value) = current {
				return Ok(value);
			}
			if rx.changed().await.is_err() {
				return Err(LeaderLost);
			}
		}
	}

	/// Number of executions currently in flight.
	pub fn len(&self) -> usize {
		self.inflight.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inflight.lock().is_empty()
	}
}
