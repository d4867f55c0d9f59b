//! Interactive reading of one gallery.
//!
//! A session owns its page table. Moving the current index schedules the
//! pages around it, drops far-away payloads and leaves failed pages alone
//! until they are invalidated.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

use super::gallery::GalleryRef;
use super::pages::{LinkOrigin, PageEntry, PageState, PageTable};
use super::resolver::{PageEvent, PageResolver, SharedPages};

#[derive(Debug, Clone, Default)]
struct Probe {
    title: Option<String>,
    error: Option<String>,
}

pub struct GallerySession {
    gallery: GalleryRef,
    resolver: Arc<PageResolver>,
    pages: SharedPages,
    events: broadcast::Sender<PageEvent>,
    tasks: Mutex<HashMap<usize, AbortHandle>>,
    probe: Arc<Mutex<Probe>>,
    probe_task: Mutex<Option<AbortHandle>>,
    current: AtomicUsize,
    prefetch_window: usize,
    reclaim_distance: usize,
    closed: AtomicBool,
}

impl GallerySession {
    /// Starts a session and, in the background, reads the gallery's page
    /// count and first page link.
    pub fn open(
        resolver: Arc<PageResolver>,
        gallery: GalleryRef,
        prefetch_window: usize,
        reclaim_distance: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let pages: SharedPages = Arc::new(Mutex::new(PageTable::new()));
        let probe = Arc::new(Mutex::new(Probe::default()));

        let probe_task = tokio::spawn(probe_gallery(
            resolver.clone(),
            gallery.clone(),
            pages.clone(),
            probe.clone(),
        ));

        log::info!("opened session for gallery {gallery}");
        GallerySession {
            gallery,
            resolver,
            pages,
            events,
            tasks: Mutex::new(HashMap::new()),
            probe,
            probe_task: Mutex::new(Some(probe_task.abort_handle())),
            current: AtomicUsize::new(0),
            prefetch_window,
            reclaim_distance: reclaim_distance.max(prefetch_window),
            closed: AtomicBool::new(false),
        }
    }

    pub fn gallery(&self) -> &GalleryRef {
        &self.gallery
    }

    pub fn title(&self) -> Option<String> {
        self.probe.lock().title.clone()
    }

    /// Why the gallery document could not be read, if it could not.
    pub fn probe_error(&self) -> Option<String> {
        self.probe.lock().error.clone()
    }

    pub fn total_pages(&self) -> Option<usize> {
        self.pages.lock().total()
    }

    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.events.subscribe()
    }

    pub fn page(&self, index: usize) -> PageEntry {
        self.pages.lock().snapshot(index)
    }

    /// Moves the reader to `index` and schedules the window around it.
    /// Returns the index actually selected once clamped to the page count.
    pub fn set_current_index(&self, index: usize) -> usize {
        if self.closed.load(Ordering::Relaxed) {
            return self.current_index();
        }

        let mut resolve = Vec::new();
        let mut reload = Vec::new();
        let index = {
            let mut table = self.pages.lock();
            let index = match table.total() {
                Some(0) => 0,
                Some(total) => index.min(total - 1),
                None => index,
            };
            self.current.store(index, Ordering::Relaxed);

            let lo = index.saturating_sub(self.prefetch_window);
            let hi = index + self.prefetch_window;
            for i in lo..=hi {
                let Some(entry) = table.entry(i) else {
                    continue;
                };
                match entry.state {
                    PageState::Unresolved => {
                        entry.state = PageState::Resolving { retry: 0 };
                        resolve.push(i);
                    }
                    PageState::Ready if entry.payload.is_none() => {
                        if let Some(url) = entry.image_url.clone() {
                            reload.push((i, url));
                        }
                    }
                    _ => {}
                }
            }

            for entry in table.iter_mut() {
                if entry.payload.is_some() && entry.index.abs_diff(index) > self.reclaim_distance {
                    entry.payload = None;
                }
            }
            index
        };

        resolve.sort_by_key(|i| i.abs_diff(index));
        for i in resolve {
            self.spawn_resolve(i, None);
        }
        for (i, url) in reload {
            self.spawn_reload(i, url);
        }
        index
    }

    /// Throws away what is known about the image of `index` and resolves it
    /// again. Observed document links are kept.
    pub fn invalidate(&self, index: usize) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        if let Some(task) = self.tasks.lock().remove(&index) {
            task.abort();
        }
        let stale = {
            let mut table = self.pages.lock();
            let Some(entry) = table.entry(index) else {
                return;
            };
            entry.payload = None;
            entry.retry_count = 0;
            entry.state = PageState::Resolving { retry: 0 };
            entry.image_url.take()
        };
        log::debug!("gallery {} page {index}: invalidated", self.gallery);
        self.spawn_resolve(index, stale);
    }

    /// Cancels everything this session is waiting on. Fetches other owners
    /// still wait for keep running.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Some(probe) = self.probe_task.lock().take() {
            probe.abort();
        }
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
        log::info!("closed session for gallery {}", self.gallery);
    }

    fn spawn_resolve(&self, index: usize, stale_image: Option<String>) {
        let resolver = self.resolver.clone();
        let gallery = self.gallery.clone();
        let pages = self.pages.clone();
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            if let Some(url) = stale_image {
                if let Err(e) = resolver.fetcher().cache().remove(&url).await {
                    log::warn!("could not drop cached {url}: {e}");
                }
            }
            let emit = move |event: PageEvent| {
                let _ = events.send(event);
            };
            if let Err(e) = resolver.resolve(&gallery, &pages, index, &emit).await {
                log::debug!("gallery {gallery} page {index} failed: {e}");
            }
        });
        self.track(index, task.abort_handle());
    }

    /// Brings back the bytes of a ready page whose payload was reclaimed.
    fn spawn_reload(&self, index: usize, image_url: String) {
        let resolver = self.resolver.clone();
        let pages = self.pages.clone();
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            let outcome = resolver.fetcher().fetch(&image_url, &image_url).await;
            let state = {
                let mut table = pages.lock();
                let Some(entry) = table.entry(index) else {
                    return;
                };
                match outcome {
                    Ok(bytes) => {
                        entry.payload = Some(bytes);
                        return;
                    }
                    Err(e) => {
                        entry.image_url = None;
                        entry.state = PageState::Failed {
                            reason: e.to_string(),
                        };
                        entry.state.clone()
                    }
                }
            };
            let _ = events.send(PageEvent { index, state });
        });
        self.track(index, task.abort_handle());
    }

    fn track(&self, index: usize, task: AbortHandle) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, t| !t.is_finished());
        tasks.insert(index, task);
    }
}

impl Drop for GallerySession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn probe_gallery(
    resolver: Arc<PageResolver>,
    gallery: GalleryRef,
    pages: SharedPages,
    probe: Arc<Mutex<Probe>>,
) {
    match resolver.gallery_detail(&gallery).await {
        Ok(detail) => {
            {
                let mut table = pages.lock();
                table.set_total(detail.total_pages);
                if let Some(first) = detail.first_page_url.as_deref() {
                    if table.get(0).is_some_and(|e| e.document_url.is_none()) {
                        table.record_link(0, first, LinkOrigin::Seed, resolver.link_policy());
                    }
                }
            }
            log::info!("gallery {gallery}: {} pages", detail.total_pages);
            probe.lock().title = Some(detail.title);
        }
        Err(e) => {
            log::warn!("gallery {gallery}: could not read details: {e}");
            probe.lock().error = Some(e.to_string());
        }
    }
}
