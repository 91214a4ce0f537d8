use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

struct Registered {
    serial: u64,
    token: CancellationToken,
}

struct Shared<K> {
    entries: Mutex<HashMap<K, Registered>>,
    next_serial: AtomicU64,
}

/// Maps in-flight request ids to their cancellation tokens.
///
/// Entries live exactly as long as the [`CancelGuard`] returned by
/// [`CancellationRegistry::with_cancel`].
pub struct CancellationRegistry<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for CancellationRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K: Hash + Eq> fmt::Debug for CancellationRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationRegistry")
            .field("in_flight", &self.shared.entries.lock().len())
            .finish()
    }
}

impl<K: Hash + Eq + Clone + fmt::Debug> Default for CancellationRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone + fmt::Debug> CancellationRegistry<K> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                next_serial: AtomicU64::new(0),
            }),
        }
    }

    /// Derive a child of `parent` and register it under `id`.
    ///
    /// The returned guard must be finished (or dropped) when the request completes; doing so
    /// removes the entry and cancels the child token.
    pub fn with_cancel(&self, parent: &CancellationToken, id: K) -> (CancellationToken, CancelGuard<K>) {
        let token = parent.child_token();
        let serial = self.shared.next_serial.fetch_add(1, Ordering::Relaxed);

        let previous = self.shared.entries.lock().insert(
            id.clone(),
            Registered {
                serial,
                token: token.clone(),
            },
        );
        if previous.is_some() {
            tracing::warn!(target: "tessera.scheduler", id = ?id, "request id reused while still in flight");
        }

        let guard = CancelGuard {
            shared: self.shared.clone(),
            id: Some(id),
            serial,
            token: token.clone(),
        };
        (token, guard)
    }

    /// Cancel the request registered under `id`.
    ///
    /// Unknown or already finished ids are ignored; returns whether a request was cancelled.
    pub fn cancel(&self, id: &K) -> bool {
        let token = self
            .shared
            .entries
            .lock()
            .get(id)
            .map(|registered| registered.token.clone());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => {
                tracing::debug!(target: "tessera.scheduler", id = ?id, "cancel for unknown request ignored");
                false
            }
        }
    }

    /// Cancel every registered request, e.g. on connection teardown.
    pub fn cancel_all(&self) {
        let tokens: Vec<_> = self
            .shared
            .entries
            .lock()
            .values()
            .map(|registered| registered.token.clone())
            .collect();
        for token in tokens {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unregisters and cancels its request when finished or dropped. Idempotent.
pub struct CancelGuard<K: Hash + Eq> {
    shared: Arc<Shared<K>>,
    id: Option<K>,
    serial: u64,
    token: CancellationToken,
}

impl<K: Hash + Eq> CancelGuard<K> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        {
            let mut entries = self.shared.entries.lock();
            // A newer registration under the same id is left alone.
            if entries.get(&id).is_some_and(|registered| registered.serial == self.serial) {
                entries.remove(&id);
            }
        }
        self.token.cancel();
    }
}

impl<K: Hash + Eq> Drop for CancelGuard<K> {
    fn drop(&mut self) {
        self.release();
    }
}
