use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::errors::LauncherError;

/// Result handed to every caller that joined the same in-flight call.
pub type SharedResult<V> = std::result::Result<V, Arc<LauncherError>>;

type InFlight<V> = Shared<BoxFuture<'static, SharedResult<V>>>;

/// Single-flight gate: at most one call per key runs at a time, and every
/// caller that arrives while it runs receives the same value or error.
pub struct RequestCoalescer<V: Clone> {
    calls: Mutex<HashMap<String, InFlight<V>>>,
}

impl<V> Default for RequestCoalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> RequestCoalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run<F, Fut>(&self, key: &str, fetch: F) -> SharedResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SharedResult<V>> + Send + 'static,
    {
        let (call, leader) = {
            let mut calls = self.lock();
            match calls.get(key) {
                Some(call) => (call.clone(), false),
                None => {
                    let call = fetch().boxed().shared();
                    calls.insert(key.to_string(), call.clone());
                    (call, true)
                }
            }
        };

        if !leader {
            tracing::debug!(key, "joining in-flight request");
            return call.await;
        }

        // The leader clears the slot even if it is dropped before completion.
        let _slot = SlotGuard {
            owner: self,
            key,
            call: call.clone(),
        };
        call.await
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlight<V>>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct SlotGuard<'a, V>
where
    V: Clone + Send + Sync + 'static,
{
    owner: &'a RequestCoalescer<V>,
    key: &'a str,
    call: InFlight<V>,
}

impl<V> Drop for SlotGuard<'_, V>
where
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let mut calls = self.owner.lock();
        if calls
            .get(self.key)
            .map(|current| current.ptr_eq(&self.call))
            .unwrap_or(false)
        {
            calls.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_call() {
        let coalescer = Arc::new(RequestCoalescer::<u32>::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let coalescer = Arc::clone(&coalescer);
            let counter = Arc::clone(&counter);
            let started = Arc::clone(&started);
            let mut release = release_rx.clone();
            handles.push(tokio::spawn(async move {
                started.fetch_add(1, Ordering::SeqCst);
                coalescer
                    .run("latest:linux-amd64-release", move || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let _ = release.wait_for(|released| *released).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        while started.load(Ordering::SeqCst) < 16 || coalescer.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        release_tx.send(true).expect("release");

        for handle in handles {
            let value = handle.await.expect("join").expect("shared result");
            assert_eq!(value, 42);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn errors_are_shared_and_slot_is_released() {
        let coalescer = RequestCoalescer::<u32>::new();

        let first = coalescer
            .run("all:linux-amd64-beta", || async {
                Err(Arc::new(LauncherError::http(503, "unavailable")))
            })
            .await;
        assert!(first.is_err());
        assert_eq!(coalescer.in_flight(), 0);

        let second = coalescer.run("all:linux-amd64-beta", || async { Ok(7) }).await;
        assert_eq!(second.expect("second call runs fresh"), 7);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let coalescer = RequestCoalescer::<u32>::new();
        let counter = AtomicUsize::new(0);

        for key in ["a", "b"] {
            let count = counter.fetch_add(1, Ordering::SeqCst) as u32;
            let value = coalescer.run(key, move || async move { Ok(count) }).await;
            assert!(value.is_ok());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
