use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use tessera_core::panic_payload_to_string;

static NEXT_NAMESPACE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("computation failed: {0}")]
    Failed(String),

    #[error("computation panicked: {0}")]
    Panicked(String),

    /// The computing task was torn down before it produced a value (runtime shutdown).
    #[error("computation abandoned")]
    Abandoned,

    /// This caller stopped waiting; the shared computation keeps running for the others.
    #[error("wait cancelled")]
    Cancelled,
}

/// Snapshot of a namespace: instance id plus the generation current at lookup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamespaceId {
    pub instance: u64,
    pub generation: u64,
}

/// An isolation scope inside a shared cache, usually one per workspace handler.
#[derive(Debug)]
pub struct Namespace {
    instance: u64,
    generation: AtomicU64,
}

impl Namespace {
    pub fn new() -> Self {
        Self {
            instance: NEXT_NAMESPACE.fetch_add(1, Ordering::Relaxed),
            generation: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> NamespaceId {
        NamespaceId {
            instance: self.instance,
            generation: self.generation.load(Ordering::Acquire),
        }
    }

    /// Invalidate every entry of this namespace.
    pub fn purge(&self) {
        let previous = self.generation.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(
            target: "tessera.cache",
            namespace = self.instance,
            generation = previous + 1,
            "namespace purged"
        );
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Slot<K> {
    namespace: NamespaceId,
    epoch: u64,
    key: K,
}

type ReadySignal<V> = watch::Receiver<Option<Result<V, CacheError>>>;

/// Finished slots are LRU-bounded; slots still computing are pinned until they publish, so
/// eviction can never start a second computation for the same slot.
struct Index<K, V> {
    ready: LruCache<Slot<K>, ReadySignal<V>>,
    in_flight: HashMap<Slot<K>, ReadySignal<V>>,
}

impl<K: Hash + Eq, V> Index<K, V> {
    fn lookup(&mut self, slot: &Slot<K>) -> Option<ReadySignal<V>> {
        if let Some(ready) = self.ready.get(slot) {
            return Some(ready.clone());
        }
        self.in_flight.get(slot).cloned()
    }

    fn len(&self) -> usize {
        self.ready.len() + self.in_flight.len()
    }
}

/// Single-flight cache keyed by `K` within a [`Namespace`].
pub struct SingleFlightCache<K, V> {
    index: Arc<Mutex<Index<K, V>>>,
    epoch: AtomicU64,
}

impl<K: Hash + Eq, V> fmt::Debug for SingleFlightCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self.index.lock();
        f.debug_struct("SingleFlightCache")
            .field("ready", &index.ready.len())
            .field("in_flight", &index.in_flight.len())
            .field("capacity", &index.ready.cap())
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `capacity` finished entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            index: Arc::new(Mutex::new(Index {
                ready: LruCache::new(capacity),
                in_flight: HashMap::new(),
            })),
            epoch: AtomicU64::new(0),
        }
    }

    /// Invalidate every entry of every namespace.
    pub fn purge(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of slots currently indexed, including unreachable ones from older generations.
    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of computations that have not published yet.
    pub fn in_flight(&self) -> usize {
        self.index.lock().in_flight.len()
    }

    pub fn capacity(&self) -> usize {
        self.index.lock().ready.cap().get()
    }

    /// Return the value for `key`, computing it if no computation exists yet.
    ///
    /// `compute` runs on a detached task, so the result is published even when the caller that
    /// started it stops waiting. Failures and panics are published to every waiter and are not
    /// retried until the namespace (or cache) is purged.
    pub async fn get<F, Fut, E>(&self, namespace: &Namespace, key: K, compute: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let ready = self.lookup_or_start(namespace, key, compute);
        wait_ready(ready).await
    }

    /// Like [`SingleFlightCache::get`], but this caller returns [`CacheError::Cancelled`] as soon
    /// as `token` fires. Other waiters on the same key are unaffected.
    pub async fn get_cancellable<F, Fut, E>(
        &self,
        namespace: &Namespace,
        key: K,
        token: &CancellationToken,
        compute: F,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        if token.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let ready = self.lookup_or_start(namespace, key, compute);
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CacheError::Cancelled),
            result = wait_ready(ready) => result,
        }
    }

    fn lookup_or_start<F, Fut, E>(&self, namespace: &Namespace, key: K, compute: F) -> ReadySignal<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let slot = Slot {
            namespace: namespace.id(),
            epoch: self.epoch.load(Ordering::Acquire),
            key,
        };

        let (ready, publisher) = {
            let mut index = self.index.lock();
            match index.lookup(&slot) {
                Some(ready) => (ready, None),
                None => {
                    let (tx, rx) = watch::channel(None);
                    index.in_flight.insert(slot.clone(), rx.clone());
                    let publisher = Publisher {
                        tx: Some(tx),
                        slot,
                        index: self.index.clone(),
                    };
                    (rx, Some(publisher))
                }
            }
        };

        // The index lock is released before the computation is created or started.
        if let Some(publisher) = publisher {
            let fut = compute();
            tokio::spawn(async move {
                let result = match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(CacheError::Failed(err.to_string())),
                    Err(payload) => {
                        let message = panic_payload_to_string(payload.as_ref());
                        tracing::error!(target: "tessera.cache", panic = %message, "cached computation panicked");
                        Err(CacheError::Panicked(message))
                    }
                };
                publisher.publish(result);
            });
        }

        ready
    }
}

/// Fires the ready signal exactly once, with [`CacheError::Abandoned`] if dropped unpublished.
///
/// Publishing moves the slot from the in-flight map into the LRU; an abandoned slot is simply
/// forgotten so the next caller retries.
struct Publisher<K: Hash + Eq, V> {
    tx: Option<watch::Sender<Option<Result<V, CacheError>>>>,
    slot: Slot<K>,
    index: Arc<Mutex<Index<K, V>>>,
}

impl<K: Hash + Eq + Clone, V> Publisher<K, V> {
    fn publish(mut self, result: Result<V, CacheError>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        {
            let mut index = self.index.lock();
            if let Some(ready) = index.in_flight.remove(&self.slot) {
                index.ready.put(self.slot.clone(), ready);
            }
        }
        tx.send_replace(Some(result));
    }
}

impl<K: Hash + Eq, V> Drop for Publisher<K, V> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.index.lock().in_flight.remove(&self.slot);
            tx.send_replace(Some(Err(CacheError::Abandoned)));
        }
    }
}

async fn wait_ready<V: Clone>(mut ready: ReadySignal<V>) -> Result<V, CacheError> {
    match ready.wait_for(Option::is_some).await {
        Ok(value) => match value.as_ref() {
            Some(result) => result.clone(),
            None => Err(CacheError::Abandoned),
        },
        Err(_) => Err(CacheError::Abandoned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn failure_is_cached_until_purge() {
        let cache: SingleFlightCache<&'static str, u32> = SingleFlightCache::new(8);
        let ns = Namespace::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let result = cache
                .get(&ns, "pkg", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>("type check failed")
                })
                .await;
            assert_eq!(result, Err(CacheError::Failed("type check failed".into())));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        ns.purge();
        let result = cache
            .get(&ns, "pkg", || async { Ok::<_, String>(7) })
            .await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn panic_is_published_and_entry_is_not_stuck() {
        let cache: SingleFlightCache<u8, u8> = SingleFlightCache::new(8);
        let ns = Namespace::new();

        let result = cache
            .get(&ns, 1, || async {
                if true {
                    panic!("analysis exploded");
                }
                Ok::<u8, String>(0)
            })
            .await;
        assert_eq!(result, Err(CacheError::Panicked("analysis exploded".into())));

        // Same generation: the failure is what every later caller sees, without hanging.
        let again = cache.get(&ns, 1, || async { Ok::<u8, String>(1) }).await;
        assert_eq!(again, Err(CacheError::Panicked("analysis exploded".into())));
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let cache: SingleFlightCache<&'static str, &'static str> = SingleFlightCache::new(8);
        let a = Namespace::new();
        let b = Namespace::new();

        assert_eq!(cache.get(&a, "k", || async { Ok::<_, String>("a") }).await, Ok("a"));
        assert_eq!(cache.get(&b, "k", || async { Ok::<_, String>("b") }).await, Ok("b"));

        a.purge();
        assert_eq!(cache.get(&a, "k", || async { Ok::<_, String>("a2") }).await, Ok("a2"));
        assert_eq!(cache.get(&b, "k", || async { Ok::<_, String>("b2") }).await, Ok("b"));
    }

    #[tokio::test]
    async fn cache_wide_purge_reaches_every_namespace() {
        let cache: SingleFlightCache<u8, u8> = SingleFlightCache::new(8);
        let ns = Namespace::new();
        assert_eq!(cache.get(&ns, 0, || async { Ok::<_, String>(1) }).await, Ok(1));
        cache.purge();
        assert_eq!(cache.get(&ns, 0, || async { Ok::<_, String>(2) }).await, Ok(2));
    }

    #[tokio::test]
    async fn lru_bound_is_respected() {
        let cache: SingleFlightCache<u32, u32> = SingleFlightCache::new(2);
        let ns = Namespace::new();
        for key in 0..5 {
            cache.get(&ns, key, move || async move { Ok::<_, String>(key) }).await.unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.capacity(), 2);

        // Key 0 was evicted and is recomputed.
        let recomputed = cache.get(&ns, 0, || async { Ok::<_, String>(100) }).await;
        assert_eq!(recomputed, Ok(100));
    }

    #[tokio::test]
    async fn published_slots_leave_the_in_flight_map() {
        let cache: SingleFlightCache<u8, u8> = SingleFlightCache::new(1);
        let ns = Namespace::new();
        for key in 0..3 {
            cache.get(&ns, key, move || async move { Ok::<_, String>(key) }).await.unwrap();
        }
        assert_eq!(cache.in_flight(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let cache: SingleFlightCache<u8, u8> = SingleFlightCache::new(0);
        assert_eq!(cache.capacity(), 1);
    }
}
