//! Turns a page index into image bytes.
//!
//! Two stages per attempt: fetch and parse the page's intermediate document
//! to learn its image URL (skipped when already memoized), then fetch the
//! image through the [`FetchCoordinator`]. A failure in either stage costs one
//! retry; retries are immediate and bounded by `max_retry` attempts.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use super::error::{PipelineError, Result};
use super::fetch::{FetchCoordinator, FetchOutcome};
use super::gallery::{GalleryDetail, GalleryRef, GallerySource};
use super::pages::{LinkOrigin, LinkPolicy, PageState, PageTable};

pub type SharedPages = Arc<Mutex<PageTable>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageEvent {
    pub index: usize,
    pub state: PageState,
}

pub struct PageResolver {
    source: Arc<dyn GallerySource>,
    fetcher: Arc<FetchCoordinator>,
    link_policy: Arc<dyn LinkPolicy>,
    max_retry: u32,
}

impl PageResolver {
    pub fn new(
        source: Arc<dyn GallerySource>,
        fetcher: Arc<FetchCoordinator>,
        link_policy: Arc<dyn LinkPolicy>,
        max_retry: u32,
    ) -> Self {
        PageResolver {
            source,
            fetcher,
            link_policy,
            max_retry: max_retry.max(1),
        }
    }

    pub fn fetcher(&self) -> &Arc<FetchCoordinator> {
        &self.fetcher
    }

    pub fn link_policy(&self) -> &dyn LinkPolicy {
        self.link_policy.as_ref()
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    /// Reads the gallery document, retrying transient failures.
    pub async fn gallery_detail(&self, gallery: &GalleryRef) -> Result<GalleryDetail> {
        let url = self.source.gallery_url(gallery);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.fetcher.fetch_document(&url).await {
                Ok(body) => self.source.parse_gallery(gallery, &body),
                Err(PipelineError::HttpStatus { status: 404, .. }) => {
                    Err(PipelineError::GalleryGone(gallery.to_string()))
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(detail) => return Ok(detail),
                Err(e) if e.is_transient() && attempt < self.max_retry => {
                    log::warn!("gallery {gallery}: attempt {attempt} failed: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drives page `index` of `pages` to `Ready` or `Failed`, reporting every
    /// state change through `on_event`.
    pub async fn resolve(
        &self,
        gallery: &GalleryRef,
        pages: &SharedPages,
        index: usize,
        on_event: &(dyn Fn(PageEvent) + Send + Sync),
    ) -> Result<Bytes> {
        let mut retry = 0;
        set_state(pages, index, PageState::Resolving { retry }, retry, on_event);

        loop {
            match self.attempt(gallery, pages, index, retry, on_event).await {
                Ok(bytes) => {
                    {
                        let mut table = pages.lock();
                        if let Some(entry) = table.entry(index) {
                            entry.payload = Some(bytes.clone());
                        }
                    }
                    set_state(pages, index, PageState::Ready, retry, on_event);
                    return Ok(bytes);
                }
                Err(e) => {
                    retry += 1;
                    if retry >= self.max_retry || e.is_structural() {
                        log::warn!("gallery {gallery} page {index}: giving up after {retry} attempts: {e}");
                        set_state(
                            pages,
                            index,
                            PageState::Failed {
                                reason: e.to_string(),
                            },
                            retry,
                            on_event,
                        );
                        return Err(e);
                    }
                    log::debug!("gallery {gallery} page {index}: attempt {retry} failed: {e}");
                    set_state(pages, index, PageState::Resolving { retry }, retry, on_event);
                }
            }
        }
    }

    async fn attempt(
        &self,
        gallery: &GalleryRef,
        pages: &SharedPages,
        index: usize,
        retry: u32,
        on_event: &(dyn Fn(PageEvent) + Send + Sync),
    ) -> Result<Bytes> {
        let image_url = match self.known_image_url(pages, index) {
            Some(url) => url,
            None => self.locate(gallery, pages, index).await?,
        };

        set_state(pages, index, PageState::Fetching { retry }, retry, on_event);
        match self.fetcher.request(&image_url, &image_url).await {
            FetchOutcome::Ready(bytes) => Ok(bytes),
            FetchOutcome::Failed(e) => {
                // The image URL may have expired; locate it again next time.
                if let Some(entry) = pages.lock().entry(index) {
                    entry.image_url = None;
                }
                Err(PipelineError::Shared(e))
            }
        }
    }

    fn known_image_url(&self, pages: &SharedPages, index: usize) -> Option<String> {
        pages.lock().get(index).and_then(|e| e.image_url.clone())
    }

    async fn locate(&self, gallery: &GalleryRef, pages: &SharedPages, index: usize) -> Result<String> {
        let document_url = pages
            .lock()
            .get(index)
            .and_then(|e| e.document_url.clone())
            .unwrap_or_else(|| self.source.page_document_url(gallery, index));

        let body = self.fetcher.fetch_document(&document_url).await?;
        let document = self.source.parse_page_document(&body)?;

        let mut table = pages.lock();
        let policy = self.link_policy.as_ref();
        if let Some(entry) = table.entry(index) {
            if entry.document_url.is_none() {
                entry.document_url = Some(document_url.clone());
            }
            entry.prev_link = document.prev_url.clone();
            entry.next_link = document.next_url.clone();
            entry.image_url = Some(document.image_url.clone());
        }
        let origin = LinkOrigin::Neighbor { from: index };
        if let (Some(prev), Some(prev_index)) = (document.prev_url.as_deref(), index.checked_sub(1)) {
            // The first page's prev link points at itself on some sites.
            if prev != document_url {
                table.record_link(prev_index, prev, origin, policy);
            }
        }
        if let Some(next) = document.next_url.as_deref() {
            if next != document_url {
                table.record_link(index + 1, next, origin, policy);
            }
        }
        Ok(document.image_url)
    }
}

fn set_state(
    pages: &SharedPages,
    index: usize,
    state: PageState,
    retry: u32,
    on_event: &(dyn Fn(PageEvent) + Send + Sync),
) {
    {
        let mut table = pages.lock();
        let Some(entry) = table.entry(index) else {
            return;
        };
        entry.state = state.clone();
        entry.retry_count = retry;
    }
    on_event(PageEvent { index, state });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cache::ImageCache;
    use crate::backend::pages::LastWriterWins;
    use crate::backend::testing::{StubSource, StubTransport, serve_gallery};

    struct Fixture {
        _temp: tempfile::TempDir,
        transport: Arc<StubTransport>,
        resolver: PageResolver,
        gallery: GalleryRef,
    }

    fn fixture(pages: usize) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let transport = Arc::new(StubTransport::new());
        let gallery = GalleryRef::new(42, "abc");
        serve_gallery(&transport, &gallery, "Fixture", pages);

        let cache = ImageCache::open(temp.path(), 1 << 20, 1 << 20).unwrap();
        let fetcher = Arc::new(FetchCoordinator::new(cache, transport.clone(), 3));
        let resolver = PageResolver::new(Arc::new(StubSource), fetcher, Arc::new(LastWriterWins), 3);
        Fixture {
            _temp: temp,
            transport,
            resolver,
            gallery,
        }
    }

    fn ignore(_: PageEvent) {}

    fn recorder() -> (Arc<Mutex<Vec<PageEvent>>>, impl Fn(PageEvent) + Send + Sync) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (events, move |event| sink.lock().push(event))
    }

    #[tokio::test]
    async fn retries_twice_then_succeeds() {
        let f = fixture(5);
        let page_two = StubSource::page_url(&f.gallery, 2);
        f.transport.fail_times(&page_two, 2);

        let pages: SharedPages = Arc::new(Mutex::new(PageTable::with_total(5)));
        let (events, sink) = recorder();

        let mut others = Vec::new();
        for index in [0, 1, 3, 4] {
            others.push(f.resolver.resolve(&f.gallery, &pages, index, &ignore));
        }
        let (two, rest) = tokio::join!(
            f.resolver.resolve(&f.gallery, &pages, 2, &sink),
            futures::future::join_all(others)
        );

        assert!(two.is_ok());
        assert!(rest.iter().all(|r| r.is_ok()));

        let trace: Vec<PageState> = events
            .lock()
            .iter()
            .filter(|e| e.index == 2 && !matches!(e.state, PageState::Fetching { .. }))
            .map(|e| e.state.clone())
            .collect();
        assert_eq!(
            trace,
            vec![
                PageState::Resolving { retry: 0 },
                PageState::Resolving { retry: 1 },
                PageState::Resolving { retry: 2 },
                PageState::Ready,
            ]
        );

        let table = pages.lock();
        for index in [0, 1, 3, 4] {
            let entry = table.get(index).unwrap();
            assert_eq!(entry.state, PageState::Ready);
            assert_eq!(entry.retry_count, 0);
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let f = fixture(3);
        let page_one = StubSource::page_url(&f.gallery, 1);
        f.transport.fail_always(&page_one);

        let pages: SharedPages = Arc::new(Mutex::new(PageTable::with_total(3)));
        let result = f.resolver.resolve(&f.gallery, &pages, 1, &ignore).await;

        assert!(result.is_err());
        assert_eq!(f.transport.document_calls(&page_one), 3);
        let entry = pages.lock().snapshot(1);
        assert!(entry.state.is_failed());
        assert_eq!(entry.retry_count, 3);
    }

    #[tokio::test]
    async fn image_failures_count_toward_the_same_budget() {
        let f = fixture(2);
        let image = StubSource::image_url(&f.gallery, 0);
        f.transport.fail_always(&image);

        let pages: SharedPages = Arc::new(Mutex::new(PageTable::with_total(2)));
        assert!(f.resolver.resolve(&f.gallery, &pages, 0, &ignore).await.is_err());
        assert_eq!(f.transport.byte_calls(&image), 3);
    }

    #[tokio::test]
    async fn memoized_image_url_skips_the_document() {
        let f = fixture(2);
        let pages: SharedPages = Arc::new(Mutex::new(PageTable::with_total(2)));
        f.resolver.resolve(&f.gallery, &pages, 0, &ignore).await.unwrap();
        f.resolver.resolve(&f.gallery, &pages, 0, &ignore).await.unwrap();

        assert_eq!(f.transport.document_calls(&StubSource::page_url(&f.gallery, 0)), 1);
    }

    #[tokio::test]
    async fn observed_neighbor_link_repairs_a_wrong_guess() {
        let f = fixture(2);
        // Page 1 really lives at a randomized URL only page 0 knows about.
        let real = "stub://s/random-token/42-2";
        let image = StubSource::image_url(&f.gallery, 1);
        f.transport
            .serve_document(real, &StubSource::page_body(&image, None, None));
        f.transport.serve_document(
            &StubSource::page_url(&f.gallery, 0),
            &StubSource::page_body(&StubSource::image_url(&f.gallery, 0), None, Some(real)),
        );
        f.transport.fail_always(&StubSource::page_url(&f.gallery, 1));

        let pages: SharedPages = Arc::new(Mutex::new(PageTable::with_total(2)));
        f.resolver.resolve(&f.gallery, &pages, 0, &ignore).await.unwrap();
        assert_eq!(pages.lock().get(1).unwrap().document_url.as_deref(), Some(real));

        f.resolver.resolve(&f.gallery, &pages, 1, &ignore).await.unwrap();
        assert_eq!(f.transport.document_calls(&StubSource::page_url(&f.gallery, 1)), 0);
    }

    #[tokio::test]
    async fn missing_gallery_is_structural() {
        let f = fixture(1);
        let gone = GalleryRef::new(7, "nope");
        let err = f.resolver.gallery_detail(&gone).await.unwrap_err();
        assert!(matches!(err, PipelineError::GalleryGone(_)));
    }

    #[tokio::test]
    async fn gallery_detail_reads_count_and_first_page() {
        let f = fixture(4);
        let detail = f.resolver.gallery_detail(&f.gallery).await.unwrap();
        assert_eq!(detail.total_pages, 4);
        assert_eq!(detail.title, "Fixture");
        assert_eq!(detail.first_page_url, Some(StubSource::page_url(&f.gallery, 0)));
    }
}
