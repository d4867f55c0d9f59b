//! Scripted network and site stand-ins shared by the unit tests.

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;

use super::error::{PipelineError, Result};
use super::gallery::{GalleryDetail, GalleryRef, GallerySource, PageDocument};
use super::transport::Transport;

#[derive(Default)]
pub struct StubTransport {
    latency: Option<Duration>,
    /// Extra delay on image downloads only.
    byte_latency: Option<Duration>,
    bytes: Mutex<HashMap<String, Bytes>>,
    documents: Mutex<HashMap<String, String>>,
    failures: Mutex<HashMap<String, u32>>,
    byte_calls: Mutex<HashMap<String, usize>>,
    document_calls: Mutex<HashMap<String, usize>>,
}

impl StubTransport {
    pub fn new() -> Self {
        StubTransport::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_byte_latency(mut self, latency: Duration) -> Self {
        self.byte_latency = Some(latency);
        self
    }

    pub fn serve_bytes(&self, url: &str, body: &[u8]) {
        self.bytes
            .lock()
            .insert(url.to_string(), Bytes::copy_from_slice(body));
    }

    pub fn serve_document(&self, url: &str, body: &str) {
        self.documents.lock().insert(url.to_string(), body.to_string());
    }

    /// The next `times` requests for `url` time out.
    pub fn fail_times(&self, url: &str, times: u32) {
        self.failures.lock().insert(url.to_string(), times);
    }

    pub fn fail_always(&self, url: &str) {
        self.fail_times(url, u32::MAX);
    }

    pub fn byte_calls(&self, url: &str) -> usize {
        self.byte_calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn document_calls(&self, url: &str) -> usize {
        self.document_calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_byte_calls(&self) -> usize {
        self.byte_calls.lock().values().sum()
    }

    async fn respond(&self, url: &str) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(url) {
            if *remaining > 0 {
                *remaining = remaining.saturating_sub(1);
                return Err(PipelineError::Timeout(url.to_string()));
            }
        }
        Ok(())
    }
}

fn not_found(url: &str) -> PipelineError {
    PipelineError::HttpStatus {
        status: 404,
        url: url.to_string(),
    }
}

impl Transport for StubTransport {
    fn fetch_bytes<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            *self.byte_calls.lock().entry(url.to_string()).or_default() += 1;
            if let Some(latency) = self.byte_latency {
                tokio::time::sleep(latency).await;
            }
            self.respond(url).await?;
            self.bytes.lock().get(url).cloned().ok_or_else(|| not_found(url))
        })
    }

    fn fetch_document<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            *self.document_calls.lock().entry(url.to_string()).or_default() += 1;
            self.respond(url).await?;
            self.documents.lock().get(url).cloned().ok_or_else(|| not_found(url))
        })
    }
}

/// A line-oriented fake site: `key=value` documents and `stub://` URLs.
pub struct StubSource;

impl StubSource {
    pub fn page_url(gallery: &GalleryRef, index: usize) -> String {
        format!("stub://s/{}/{}-{}", gallery.token, gallery.gid, index + 1)
    }

    pub fn image_url(gallery: &GalleryRef, index: usize) -> String {
        format!("stub://img/{}/{:03}.png", gallery.gid, index + 1)
    }

    pub fn page_body(image: &str, prev: Option<&str>, next: Option<&str>) -> String {
        let mut body = format!("img={image}\n");
        if let Some(prev) = prev {
            body.push_str(&format!("prev={prev}\n"));
        }
        if let Some(next) = next {
            body.push_str(&format!("next={next}\n"));
        }
        body
    }
}

fn field<'a>(body: &'a str, name: &str) -> Option<&'a str> {
    body.lines()
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
}

impl GallerySource for StubSource {
    fn gallery_url(&self, gallery: &GalleryRef) -> String {
        format!("stub://g/{}/{}", gallery.gid, gallery.token)
    }

    fn parse_gallery(&self, gallery: &GalleryRef, body: &str) -> Result<GalleryDetail> {
        let total_pages = field(body, "pages")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| PipelineError::Parse(format!("no page count for {gallery}")))?;
        Ok(GalleryDetail {
            title: field(body, "title").unwrap_or("untitled").to_string(),
            total_pages,
            first_page_url: field(body, "first").map(str::to_string),
        })
    }

    fn page_document_url(&self, gallery: &GalleryRef, index: usize) -> String {
        StubSource::page_url(gallery, index)
    }

    fn parse_page_document(&self, body: &str) -> Result<PageDocument> {
        let image_url = field(body, "img")
            .ok_or_else(|| PipelineError::Parse("no image".to_string()))?
            .to_string();
        Ok(PageDocument {
            image_url,
            prev_url: field(body, "prev").map(str::to_string),
            next_url: field(body, "next").map(str::to_string),
        })
    }
}

/// Small valid PNG whose first pixel encodes `seed`.
pub fn png_bytes(seed: u8) -> Vec<u8> {
    let mut img = image::RgbImage::new(2, 2);
    img.put_pixel(0, 0, image::Rgb([seed, 0, 0]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

/// Registers a whole gallery of `pages` pages on `transport`, each page
/// document linking to its neighbors by their deterministic URLs.
pub fn serve_gallery(transport: &StubTransport, gallery: &GalleryRef, title: &str, pages: usize) {
    let source = StubSource;
    transport.serve_document(
        &source.gallery_url(gallery),
        &format!(
            "title={title}\npages={pages}\nfirst={}\n",
            StubSource::page_url(gallery, 0)
        ),
    );
    for index in 0..pages {
        let prev = index.checked_sub(1).map(|i| StubSource::page_url(gallery, i));
        let next = (index + 1 < pages).then(|| StubSource::page_url(gallery, index + 1));
        let image = StubSource::image_url(gallery, index);
        transport.serve_document(
            &StubSource::page_url(gallery, index),
            &StubSource::page_body(&image, prev.as_deref(), next.as_deref()),
        );
        transport.serve_bytes(&image, &png_bytes(index as u8));
    }
}

/// Polls `done` until it holds, failing the test after five seconds.
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
