//! Single-flight image fetching on top of [`ImageCache`].
//!
//! Every request for a key either resolves from the memory tier on the spot
//! or joins the one flight running for that key. A flight checks the disk
//! tier, then the network, stores the result and fans it out to every waiter
//! it has at that moment. Dropping a [`FetchHandle`] withdraws its waiter;
//! the flight is aborted only once nobody is waiting for it.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{Semaphore, oneshot};
use tokio::task::AbortHandle;

use super::cache::ImageCache;
use super::error::{PipelineError, Result};
use super::transport::Transport;

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Ready(Bytes),
    Failed(Arc<PipelineError>),
}

impl FetchOutcome {
    pub fn into_result(self) -> std::result::Result<Bytes, Arc<PipelineError>> {
        match self {
            FetchOutcome::Ready(bytes) => Ok(bytes),
            FetchOutcome::Failed(err) => Err(err),
        }
    }
}

struct InFlight {
    flight: u64,
    waiters: HashMap<u64, oneshot::Sender<FetchOutcome>>,
    task: Option<AbortHandle>,
}

type Registry = Arc<Mutex<HashMap<String, InFlight>>>;

pub struct FetchCoordinator {
    cache: ImageCache,
    transport: Arc<dyn Transport>,
    permits: Arc<Semaphore>,
    registry: Registry,
    ids: AtomicU64,
    network_fetches: Arc<AtomicU64>,
}

impl FetchCoordinator {
    pub fn new(cache: ImageCache, transport: Arc<dyn Transport>, workers: usize) -> Self {
        FetchCoordinator {
            cache,
            transport,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            registry: Arc::new(Mutex::new(HashMap::new())),
            ids: AtomicU64::new(1),
            network_fetches: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Number of keys with a flight currently running.
    pub fn in_flight(&self) -> usize {
        self.registry.lock().len()
    }

    /// Network downloads started since creation.
    pub fn network_fetches(&self) -> u64 {
        self.network_fetches.load(Ordering::Relaxed)
    }

    /// Asks for the bytes of `key`, downloading `url` on a miss.
    pub fn request(&self, key: &str, url: &str) -> FetchHandle {
        let waiter = self.ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let handle = FetchHandle {
            key: key.to_string(),
            waiter,
            rx,
            registry: self.registry.clone(),
            settled: false,
        };

        if let Some(bytes) = self.cache.get_memory(key) {
            let _ = tx.send(FetchOutcome::Ready(bytes));
            return handle;
        }

        let mut registry = self.registry.lock();
        if let Some(flight) = registry.get_mut(key) {
            log::debug!("joining in-flight fetch for {key}");
            flight.waiters.insert(waiter, tx);
            return handle;
        }

        let flight = self.ids.fetch_add(1, Ordering::Relaxed);
        let mut waiters = HashMap::new();
        waiters.insert(waiter, tx);
        let task = tokio::spawn(run_flight(
            flight,
            key.to_string(),
            url.to_string(),
            self.cache.clone(),
            self.transport.clone(),
            self.permits.clone(),
            self.registry.clone(),
            self.network_fetches.clone(),
        ));
        registry.insert(
            key.to_string(),
            InFlight {
                flight,
                waiters,
                task: Some(task.abort_handle()),
            },
        );
        handle
    }

    /// Fetches an intermediate document through the same worker pool.
    /// Documents are not cached.
    pub async fn fetch_document(&self, url: &str) -> Result<String> {
        let _permit = self.permits.acquire().await.map_err(|_| PipelineError::Cancelled)?;
        self.transport.fetch_document(url).await
    }

    /// Convenience wrapper that awaits a single request.
    pub async fn fetch(&self, key: &str, url: &str) -> std::result::Result<Bytes, Arc<PipelineError>> {
        self.request(key, url).await.into_result()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_flight(
    flight: u64,
    key: String,
    url: String,
    cache: ImageCache,
    transport: Arc<dyn Transport>,
    permits: Arc<Semaphore>,
    registry: Registry,
    network_fetches: Arc<AtomicU64>,
) {
    let outcome = match download(&key, &url, &cache, transport.as_ref(), &permits, &network_fetches).await {
        Ok(bytes) => FetchOutcome::Ready(bytes),
        Err(e) => {
            log::debug!("fetch of {url} failed: {e}");
            FetchOutcome::Failed(Arc::new(e))
        }
    };

    let waiters = {
        let mut registry = registry.lock();
        match registry.get(&key) {
            Some(entry) if entry.flight == flight => registry.remove(&key).map(|e| e.waiters),
            _ => None,
        }
    };
    for (_, tx) in waiters.into_iter().flatten() {
        let _ = tx.send(outcome.clone());
    }
}

async fn download(
    key: &str,
    url: &str,
    cache: &ImageCache,
    transport: &dyn Transport,
    permits: &Semaphore,
    network_fetches: &AtomicU64,
) -> Result<Bytes> {
    if let Some(bytes) = cache.get(key).await {
        return Ok(bytes);
    }

    let _permit = permits.acquire().await.map_err(|_| PipelineError::Cancelled)?;
    network_fetches.fetch_add(1, Ordering::Relaxed);
    let bytes = transport.fetch_bytes(url).await?;
    if let Err(e) = cache.put(key, bytes.clone()).await {
        log::warn!("could not cache {key}: {e}");
    }
    Ok(bytes)
}

/// One waiter's interest in a key. Resolves to the flight's outcome; dropping
/// it before then cancels the interest.
pub struct FetchHandle {
    key: String,
    waiter: u64,
    rx: oneshot::Receiver<FetchOutcome>,
    registry: Registry,
    settled: bool,
}

impl FetchHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn cancel(self) {}
}

impl Future for FetchHandle {
    type Output = FetchOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.settled = true;
                Poll::Ready(
                    result.unwrap_or_else(|_| FetchOutcome::Failed(Arc::new(PipelineError::Cancelled))),
                )
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for FetchHandle {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut registry = self.registry.lock();
        let Some(flight) = registry.get_mut(&self.key) else {
            return;
        };
        if flight.waiters.remove(&self.waiter).is_none() || !flight.waiters.is_empty() {
            return;
        }
        if let Some(task) = flight.task.take() {
            log::debug!("last waiter left, aborting fetch for {}", self.key);
            task.abort();
        }
        registry.remove(&self.key);
    }
}
