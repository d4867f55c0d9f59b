use std::sync::Arc;

use super::cache::ImageCache;
use super::config::Settings;
use super::download::{DownloadQueue, QueueOptions, TaskStore};
use super::ehentai::EhSource;
use super::error::Result;
use super::fetch::FetchCoordinator;
use super::gallery::{GalleryRef, GallerySource};
use super::pages::{LastWriterWins, LinkPolicy};
use super::resolver::PageResolver;
use super::session::GallerySession;
use super::transport::{HttpTransport, Transport};

/// Owns everything interactive reading and background downloading share:
/// the cache, the fetch coordinator and the download queue.
pub struct Engine {
    settings: Settings,
    resolver: Arc<PageResolver>,
    downloads: DownloadQueue,
}

impl Engine {
    pub fn new(
        settings: Settings,
        transport: Arc<dyn Transport>,
        source: Arc<dyn GallerySource>,
        link_policy: Arc<dyn LinkPolicy>,
    ) -> Result<Self> {
        let cache = ImageCache::open(
            &settings.cache_dir,
            settings.memory_cache_bytes,
            settings.disk_cache_bytes,
        )?;
        let fetcher = Arc::new(FetchCoordinator::new(cache, transport, settings.fetch_workers));
        let resolver = Arc::new(PageResolver::new(source, fetcher, link_policy, settings.max_retry));
        let downloads = DownloadQueue::open(
            resolver.clone(),
            TaskStore::new(&settings.task_list_path),
            QueueOptions::from_settings(&settings),
        );
        Ok(Engine {
            settings,
            resolver,
            downloads,
        })
    }

    /// The stock setup: HTTP transport and E-Hentai page parsing.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&settings)?);
        let source = Arc::new(EhSource::new(&settings.base_url));
        Engine::new(settings, transport, source, Arc::new(LastWriterWins))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &ImageCache {
        self.resolver.fetcher().cache()
    }

    pub fn downloads(&self) -> &DownloadQueue {
        &self.downloads
    }

    pub fn open_gallery(&self, gallery: GalleryRef) -> GallerySession {
        GallerySession::open(
            self.resolver.clone(),
            gallery,
            self.settings.prefetch_window,
            self.settings.reclaim_distance,
        )
    }

    /// Writes the task list and memory-only cache entries back to disk.
    pub async fn shutdown(&self) -> Result<()> {
        self.downloads.sync().await?;
        self.cache().flush().await
    }
}
