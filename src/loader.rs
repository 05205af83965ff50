use crate::error::{Error, Result};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Fetch<K, V> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<V>> + Send + Sync>;
type PendingLoad<V> = Shared<BoxFuture<'static, Result<V>>>;

enum Slot<V> {
    Loaded { value: V, loaded_at: Instant },
    Loading(PendingLoad<V>),
}

/// Memoizing cache where concurrent loads of the same key share one fetch.
///
/// A successful fetch is kept until `ttl` elapses (forever when `ttl` is `None`),
/// a failed one is dropped so the next load fetches again. Every fetch and every
/// waiter is bound to the run's cancellation token.
pub struct Loader<K, V> {
    fetch: Fetch<K, V>,
    ttl: Option<Duration>,
    cancel: CancellationToken,
    slots: Arc<Mutex<HashMap<K, Slot<V>>>>,
}

impl<K, V> Loader<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(fetch: F, ttl: Option<Duration>, cancel: CancellationToken) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        Self {
            fetch: Arc::new(move |key| fetch(key).boxed()),
            ttl,
            cancel,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn load(&self, key: &K) -> Result<V> {
        let (pending, started) = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.get(key) {
                Some(Slot::Loaded { value, loaded_at }) if !self.is_expired(*loaded_at) => {
                    return Ok(value.clone());
                }
                Some(Slot::Loading(pending)) => (pending.clone(), false),
                _ => {
                    let pending = self.start(key.clone());
                    slots.insert(key.clone(), Slot::Loading(pending.clone()));
                    (pending, true)
                }
            }
        };

        // Drive the fetch on its own task so it completes even if this caller goes away
        if started {
            tokio::spawn(pending.clone());
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = pending => result,
        }
    }

    fn is_expired(&self, loaded_at: Instant) -> bool {
        self.ttl.is_some_and(|ttl| loaded_at.elapsed() > ttl)
    }

    fn start(&self, key: K) -> PendingLoad<V> {
        let fetch = (self.fetch)(key.clone());
        let slots = Arc::clone(&self.slots);
        let cancel = self.cancel.clone();

        async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = fetch => result,
            };
            let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
            match &result {
                Ok(value) => {
                    slots.insert(
                        key,
                        Slot::Loaded {
                            value: value.clone(),
                            loaded_at: Instant::now(),
                        },
                    );
                }
                Err(_) => {
                    slots.remove(&key);
                }
            }
            result
        }
        .boxed()
        .shared()
    }
}
