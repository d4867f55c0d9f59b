//! Persisted background download queue.
//!
//! One task downloads at a time, its pages with a small bounded parallelism.
//! The task list is written to disk on every transition; tasks that were
//! active when the process went away are resumed on the next start.

mod speed;
mod store;
mod task;

pub use speed::SpeedMeter;
pub use store::TaskStore;
pub use task::{DownloadTask, TaskState, folder_name, page_file_name};

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::{Notify, broadcast};
use tokio::task::AbortHandle;

use super::config::Settings;
use super::error::{PipelineError, Result};
use super::gallery::GalleryRef;
use super::pages::{LinkOrigin, PageState, PageTable};
use super::resolver::{PageEvent, PageResolver, SharedPages};
use task::index_from_stem;

#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Added(DownloadTask),
    Updated(DownloadTask),
    Removed(GalleryRef),
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub download_dir: PathBuf,
    pub parallelism: usize,
    pub speed_window: Duration,
}

impl QueueOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        QueueOptions {
            download_dir: settings.download_dir.clone(),
            parallelism: settings.download_parallelism.max(1),
            speed_window: settings.speed_window(),
        }
    }
}

struct ActiveRun {
    gid: u64,
    stop: Arc<AtomicBool>,
    /// Set when the task was deleted mid-run. A detached run no longer
    /// writes to any task record, even one queued again under the same gid.
    detached: bool,
    /// Folder to remove once the run winds down, set when the task is
    /// deleted with its files while downloading.
    purge: Option<PathBuf>,
}

enum RunOutcome {
    Finished,
    Stopped,
    Incomplete { failed: usize },
    Failed(PipelineError),
}

enum PageOutcome {
    Done,
    Failed,
    Skipped,
}

struct QueueInner {
    resolver: Arc<PageResolver>,
    store: Arc<TaskStore>,
    options: QueueOptions,
    tasks: Mutex<Vec<DownloadTask>>,
    active: Mutex<Option<ActiveRun>>,
    /// Bumped for every snapshot handed to the store.
    version: AtomicU64,
    events: broadcast::Sender<DownloadEvent>,
    wake: Notify,
}

pub struct DownloadQueue {
    inner: Arc<QueueInner>,
    runner: AbortHandle,
}

impl DownloadQueue {
    /// Loads the stored task list and starts the background runner. Tasks
    /// that were waiting or downloading are queued again in stored order.
    pub fn open(resolver: Arc<PageResolver>, store: TaskStore, options: QueueOptions) -> Self {
        let mut tasks = store.load();
        let mut resumed = 0;
        for task in &mut tasks {
            task.bytes_per_second = 0;
            if task.is_active() {
                task.state = TaskState::Waiting;
                resumed += 1;
            }
        }
        log::info!("loaded {} download tasks, resuming {}", tasks.len(), resumed);

        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(QueueInner {
            resolver,
            store: Arc::new(store),
            options,
            tasks: Mutex::new(tasks),
            active: Mutex::new(None),
            version: AtomicU64::new(0),
            events,
            wake: Notify::new(),
        });
        if resumed > 0 {
            inner.persist();
        }

        let runner = tokio::spawn(run_queue(inner.clone()));
        DownloadQueue {
            inner,
            runner: runner.abort_handle(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    pub fn tasks(&self) -> Vec<DownloadTask> {
        self.inner.tasks.lock().clone()
    }

    pub fn task(&self, gid: u64) -> Option<DownloadTask> {
        self.inner.task(gid)
    }

    pub fn download_dir(&self) -> &Path {
        &self.inner.options.download_dir
    }

    /// Waits until the current task list is on disk.
    pub async fn sync(&self) -> Result<()> {
        self.inner.sync().await
    }

    /// Queues a gallery. An existing stopped task for the same gallery is
    /// started again instead; returns `false` when nothing changed.
    pub fn enqueue(&self, gallery: GalleryRef, title: &str, thumbnail_url: Option<String>) -> bool {
        let gid = gallery.gid;
        let exists = self.inner.tasks.lock().iter().any(|t| t.gid() == gid);
        if exists {
            return self.start(gid);
        }

        let mut task = DownloadTask::new(gallery, title, thumbnail_url);
        task.state = TaskState::Waiting;
        log::info!("queued download of gallery {} ({})", task.gallery, task.title);
        self.inner.tasks.lock().push(task.clone());
        self.inner.persist();
        let _ = self.inner.events.send(DownloadEvent::Added(task));
        self.inner.wake.notify_one();
        true
    }

    pub fn start(&self, gid: u64) -> bool {
        let started = self.inner.modify(gid, |task| {
            if task.state != TaskState::None {
                return false;
            }
            task.state = TaskState::Waiting;
            task.last_error = None;
            true
        });
        if started.is_some() {
            self.inner.wake.notify_one();
        }
        started.is_some()
    }

    /// Stops a task. A running task finishes the pages it is on first and
    /// only then reports `None`.
    pub fn stop(&self, gid: u64) -> bool {
        let state = self.inner.task(gid).map(|t| t.state);
        match state {
            Some(TaskState::Waiting) => self
                .inner
                .modify(gid, |task| {
                    let waiting = task.state == TaskState::Waiting;
                    if waiting {
                        task.state = TaskState::None;
                    }
                    waiting
                })
                .is_some(),
            Some(TaskState::Downloading) => self.inner.signal_stop(gid),
            _ => false,
        }
    }

    pub fn start_all(&self) {
        let changed = self.inner.modify_all(|task| {
            if task.state != TaskState::None {
                return false;
            }
            task.state = TaskState::Waiting;
            task.last_error = None;
            true
        });
        if changed {
            self.inner.wake.notify_one();
        }
    }

    pub fn stop_all(&self) {
        self.inner.modify_all(|task| {
            if task.state != TaskState::Waiting {
                return false;
            }
            task.state = TaskState::None;
            true
        });
        let running = self.inner.active.lock().as_ref().map(|run| run.gid);
        if let Some(gid) = running {
            self.inner.signal_stop(gid);
        }
    }

    /// Forgets a task, optionally removing its folder. The folder of a
    /// running task is removed once its in-flight pages are done.
    pub async fn delete(&self, gid: u64, also_files: bool) -> Result<bool> {
        let removed = {
            let mut tasks = self.inner.tasks.lock();
            let Some(position) = tasks.iter().position(|t| t.gid() == gid) else {
                return Ok(false);
            };
            tasks.remove(position)
        };
        let folder = removed.folder(&self.inner.options.download_dir);
        let running = self.inner.detach_run(gid, also_files.then(|| folder.clone()));

        self.inner.persist();
        log::info!("deleted download of gallery {}", removed.gallery);
        let _ = self.inner.events.send(DownloadEvent::Removed(removed.gallery));

        if also_files && !running {
            remove_folder(folder).await?;
        }
        Ok(true)
    }
}

impl Drop for DownloadQueue {
    fn drop(&mut self) {
        self.runner.abort();
    }
}

async fn run_queue(inner: Arc<QueueInner>) {
    loop {
        match inner.claim_next() {
            Some((gid, stop)) => inner.run_task(gid, stop).await,
            None => inner.wake.notified().await,
        }
    }
}

async fn remove_folder(folder: PathBuf) -> Result<()> {
    let result = tokio::task::spawn_blocking(move || match fs::remove_dir_all(&folder) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    })
    .await
    .map_err(|e| PipelineError::storage(e.to_string()))?;
    Ok(result?)
}

fn ignore_page_event(_: PageEvent) {}

impl QueueInner {
    fn task(&self, gid: u64) -> Option<DownloadTask> {
        self.tasks.lock().iter().find(|t| t.gid() == gid).cloned()
    }

    fn snapshot(&self) -> (u64, Vec<DownloadTask>) {
        let tasks = self.tasks.lock();
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        (version, tasks.clone())
    }

    /// Hands the current list to a blocking thread for saving.
    fn persist(&self) {
        let (version, snapshot) = self.snapshot();
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.save_version(version, &snapshot) {
                log::error!("could not save task list {}: {}", store.path().display(), e);
            }
        });
    }

    async fn sync(&self) -> Result<()> {
        let (version, snapshot) = self.snapshot();
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save_version(version, &snapshot))
            .await
            .map_err(|e| PipelineError::storage(e.to_string()))??;
        Ok(())
    }

    /// Applies `f` to task `gid`; when it reports a change the list is
    /// persisted and observers are told.
    fn modify(&self, gid: u64, f: impl FnOnce(&mut DownloadTask) -> bool) -> Option<DownloadTask> {
        self.apply(gid, false, f)
    }

    /// Like [`QueueInner::modify`], but only while the current run still
    /// owns task `gid`.
    fn modify_run(&self, gid: u64, f: impl FnOnce(&mut DownloadTask) -> bool) -> Option<DownloadTask> {
        self.apply(gid, true, f)
    }

    fn apply(
        &self,
        gid: u64,
        run_only: bool,
        f: impl FnOnce(&mut DownloadTask) -> bool,
    ) -> Option<DownloadTask> {
        let snapshot = {
            let mut tasks = self.tasks.lock();
            if run_only && !self.owns_run(gid) {
                return None;
            }
            let task = tasks.iter_mut().find(|t| t.gid() == gid)?;
            if !f(task) {
                return None;
            }
            task.clone()
        };
        self.persist();
        let _ = self.events.send(DownloadEvent::Updated(snapshot.clone()));
        Some(snapshot)
    }

    fn modify_all(&self, mut f: impl FnMut(&mut DownloadTask) -> bool) -> bool {
        let changed: Vec<DownloadTask> = {
            let mut tasks = self.tasks.lock();
            tasks
                .iter_mut()
                .filter_map(|task| f(task).then(|| task.clone()))
                .collect()
        };
        if changed.is_empty() {
            return false;
        }
        self.persist();
        for task in changed {
            let _ = self.events.send(DownloadEvent::Updated(task));
        }
        true
    }

    fn owns_run(&self, gid: u64) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|run| run.gid == gid && !run.detached)
    }

    /// Asks the running task `gid` to stop. Returns whether it was running.
    fn signal_stop(&self, gid: u64) -> bool {
        let mut active = self.active.lock();
        match active.as_mut() {
            Some(run) if run.gid == gid => {
                log::info!("stopping download of gallery {gid}");
                run.stop.store(true, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Stops the run of a deleted task and cuts it off from the task list.
    fn detach_run(&self, gid: u64, purge: Option<PathBuf>) -> bool {
        let mut active = self.active.lock();
        match active.as_mut() {
            Some(run) if run.gid == gid && !run.detached => {
                log::info!("detaching download of deleted gallery {gid}");
                run.stop.store(true, Ordering::Relaxed);
                run.detached = true;
                run.purge = purge;
                true
            }
            _ => false,
        }
    }

    /// Moves the first waiting task to `Downloading`.
    fn claim_next(&self) -> Option<(u64, Arc<AtomicBool>)> {
        let claimed = {
            let mut tasks = self.tasks.lock();
            let task = tasks.iter_mut().find(|t| t.state == TaskState::Waiting)?;
            task.state = TaskState::Downloading;
            task.bytes_per_second = 0;

            let stop = Arc::new(AtomicBool::new(false));
            *self.active.lock() = Some(ActiveRun {
                gid: task.gid(),
                stop: stop.clone(),
                detached: false,
                purge: None,
            });
            (task.clone(), stop)
        };
        self.persist();
        let (task, stop) = claimed;
        log::info!("downloading gallery {} ({})", task.gallery, task.title);
        let gid = task.gid();
        let _ = self.events.send(DownloadEvent::Updated(task));
        Some((gid, stop))
    }

    async fn run_task(&self, gid: u64, stop: Arc<AtomicBool>) {
        let outcome = self.download(gid, &stop).await;

        let (snapshot, purge) = {
            let mut tasks = self.tasks.lock();
            let (detached, purge) = match self.active.lock().take() {
                Some(run) => (run.detached, run.purge),
                None => (false, None),
            };
            let owned = tasks.iter_mut().find(|t| t.gid() == gid && !detached);
            let snapshot = owned.map(|task| {
                task.bytes_per_second = 0;
                match &outcome {
                    RunOutcome::Finished => {
                        task.state = TaskState::Finished;
                        task.last_error = None;
                    }
                    RunOutcome::Stopped => task.state = TaskState::None,
                    RunOutcome::Incomplete { failed } => {
                        task.state = TaskState::None;
                        task.last_error = Some(format!("{failed} pages failed"));
                    }
                    RunOutcome::Failed(e) => {
                        task.state = TaskState::None;
                        task.last_error = Some(e.to_string());
                    }
                }
                task.clone()
            });
            (snapshot, purge)
        };

        match &outcome {
            RunOutcome::Finished => log::info!("gallery {gid} finished"),
            RunOutcome::Stopped => log::info!("gallery {gid} stopped"),
            RunOutcome::Incomplete { failed } => log::warn!("gallery {gid}: {failed} pages failed"),
            RunOutcome::Failed(e) => log::error!("gallery {gid} failed: {e}"),
        }

        if let Some(task) = snapshot {
            self.persist();
            let _ = self.events.send(DownloadEvent::Updated(task));
        }
        if let Some(folder) = purge {
            if let Err(e) = remove_folder(folder).await {
                log::error!("could not remove files of gallery {gid}: {e}");
            }
        }
    }

    async fn download(&self, gid: u64, stop: &AtomicBool) -> RunOutcome {
        let Some(task) = self.task(gid) else {
            return RunOutcome::Stopped;
        };
        let gallery = task.gallery.clone();

        let (total, task) = match task.total_pages {
            Some(total) => (total, task),
            None => match self.resolver.gallery_detail(&gallery).await {
                Ok(detail) => {
                    let updated = self.modify_run(gid, |t| {
                        t.total_pages = Some(detail.total_pages);
                        if t.title.trim().is_empty() {
                            t.title = detail.title.clone();
                        }
                        if let Some(first) = &detail.first_page_url {
                            t.page_links.entry(0).or_insert_with(|| first.clone());
                        }
                        true
                    });
                    match updated {
                        Some(task) => (detail.total_pages, task),
                        None => return RunOutcome::Stopped,
                    }
                }
                Err(e) => return RunOutcome::Failed(e),
            },
        };

        let folder = task.folder(&self.options.download_dir);
        let existing = match prepare_folder(folder.clone(), total).await {
            Ok(existing) => existing,
            Err(e) => return RunOutcome::Failed(e.with_context("preparing download folder")),
        };

        let mut table = PageTable::with_total(total);
        for (&index, link) in &task.page_links {
            table.record_link(index, link, LinkOrigin::Seed, self.resolver.link_policy());
        }
        for (&index, path) in &existing {
            if let Some(entry) = table.entry(index) {
                entry.state = PageState::Ready;
                entry.local_path = Some(path.clone());
            }
        }
        let legacy = existing.len();
        if legacy > 0 {
            log::info!("gallery {gid}: reusing {legacy} pages already on disk");
        }
        self.modify_run(gid, |t| {
            t.legacy_page_count = legacy;
            t.completed_pages = legacy;
            t.failed_pages = 0;
            true
        });

        let pages: SharedPages = Arc::new(Mutex::new(table));
        let meter = Mutex::new(SpeedMeter::new(self.options.speed_window));
        let pending: Vec<usize> = (0..total).filter(|i| !existing.contains_key(i)).collect();

        let outcomes: Vec<PageOutcome> = futures::stream::iter(pending)
            .map(|index| {
                let gallery = &gallery;
                let folder = &folder;
                let pages = &pages;
                let meter = &meter;
                async move {
                    if stop.load(Ordering::Relaxed) {
                        return PageOutcome::Skipped;
                    }
                    self.download_page(gallery, folder, pages, index, total, meter)
                        .await
                }
            })
            .buffer_unordered(self.options.parallelism.max(1))
            .collect()
            .await;

        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, PageOutcome::Failed))
            .count();
        let completed = self.task(gid).map_or(0, |t| t.completed_pages);
        if failed == 0 && completed >= total {
            RunOutcome::Finished
        } else if stop.load(Ordering::Relaxed) {
            RunOutcome::Stopped
        } else {
            RunOutcome::Incomplete { failed }
        }
    }

    async fn download_page(
        &self,
        gallery: &GalleryRef,
        folder: &Path,
        pages: &SharedPages,
        index: usize,
        total: usize,
        meter: &Mutex<SpeedMeter>,
    ) -> PageOutcome {
        let gid = gallery.gid;
        let bytes = match self.resolver.resolve(gallery, pages, index, &ignore_page_event).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("gallery {gid} page {index}: {e}");
                self.modify_run(gid, |t| {
                    t.failed_pages += 1;
                    true
                });
                return PageOutcome::Failed;
            }
        };

        let image_url = pages
            .lock()
            .get(index)
            .and_then(|e| e.image_url.clone())
            .unwrap_or_default();
        let path = folder.join(page_file_name(index, &image_url));
        let received = bytes.len() as u64;

        if let Err(e) = write_page(path.clone(), bytes).await {
            log::error!("gallery {gid} page {index}: could not save {}: {e}", path.display());
            if let Some(entry) = pages.lock().entry(index) {
                entry.payload = None;
                entry.state = PageState::Failed {
                    reason: e.to_string(),
                };
            }
            self.modify_run(gid, |t| {
                t.failed_pages += 1;
                true
            });
            return PageOutcome::Failed;
        }

        let links: BTreeMap<usize, String> = {
            let mut table = pages.lock();
            if let Some(entry) = table.entry(index) {
                entry.payload = None;
                entry.local_path = Some(path);
            }
            table
                .iter()
                .filter_map(|e| e.document_url.clone().map(|url| (e.index, url)))
                .collect()
        };
        let rate = {
            let mut meter = meter.lock();
            meter.record(received);
            meter.rate()
        };
        self.modify_run(gid, |t| {
            t.completed_pages = (t.completed_pages + 1).min(total);
            t.bytes_per_second = rate;
            t.page_links = links;
            true
        });
        PageOutcome::Done
    }
}

/// Creates the task folder and returns the valid page files already in it.
async fn prepare_folder(folder: PathBuf, total: usize) -> Result<HashMap<usize, PathBuf>> {
    tokio::task::spawn_blocking(move || {
        fs::create_dir_all(&folder)?;
        scan_folder(&folder, total)
    })
    .await
    .map_err(|e| PipelineError::storage(e.to_string()))?
}

fn scan_folder(folder: &Path, total: usize) -> Result<HashMap<usize, PathBuf>> {
    let mut found = HashMap::new();
    for entry in fs::read_dir(folder)?.flatten() {
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.starts_with(".tmp") {
            let _ = fs::remove_file(&path);
            continue;
        }
        let Some(index) = index_from_stem(stem) else {
            continue;
        };
        if index >= total || found.contains_key(&index) {
            continue;
        }
        if is_valid_image(&path) {
            found.insert(index, path);
        } else {
            log::debug!("discarding unreadable page file {}", path.display());
            let _ = fs::remove_file(&path);
        }
    }
    Ok(found)
}

fn is_valid_image(path: &Path) -> bool {
    let non_empty = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    non_empty
        && image::ImageReader::open(path)
            .and_then(|reader| reader.with_guessed_format())
            .map(|reader| reader.decode().is_ok())
            .unwrap_or(false)
}

async fn write_page(path: PathBuf, bytes: Bytes) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| PipelineError::storage(format!("no parent for {}", path.display())))?;
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(&bytes)?;
        file.persist(&path)
            .map_err(|e| PipelineError::storage(format!("{}: {}", path.display(), e.error)))?;
        Ok(())
    })
    .await
    .map_err(|e| PipelineError::storage(e.to_string()))?
}
