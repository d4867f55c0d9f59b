//! Per-owner page bookkeeping.
//!
//! A [`PageTable`] belongs to exactly one gallery session or download task.
//! It is dense once the page count is known and sparse before that.

use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PageState {
    #[default]
    Unresolved,
    /// Locating the image URL through the intermediate document.
    Resolving { retry: u32 },
    /// Image URL known, bytes on their way.
    Fetching { retry: u32 },
    Ready,
    Failed { reason: String },
}

impl PageState {
    pub fn is_busy(&self) -> bool {
        matches!(self, PageState::Resolving { .. } | PageState::Fetching { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PageState::Failed { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PageEntry {
    pub index: usize,
    pub state: PageState,
    /// Intermediate document of this page, as observed from a neighbor or
    /// confirmed by fetching it.
    pub document_url: Option<String>,
    pub prev_link: Option<String>,
    pub next_link: Option<String>,
    pub image_url: Option<String>,
    pub local_path: Option<PathBuf>,
    pub retry_count: u32,
    pub payload: Option<Bytes>,
}

impl PageEntry {
    pub fn new(index: usize) -> Self {
        PageEntry {
            index,
            ..PageEntry::default()
        }
    }
}

/// Who told us about a page's document URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOrigin {
    /// The gallery document (first page link) or a persisted record.
    Seed,
    /// The `prev`/`next` link found in page `from`'s document.
    Neighbor { from: usize },
}

/// Decides what happens when a newly observed document URL disagrees with
/// the one already recorded for an index.
pub trait LinkPolicy: Send + Sync {
    fn replace(&self, index: usize, recorded: &str, observed: &str, origin: LinkOrigin) -> bool;
}

/// The most recent observation wins; disagreements are logged.
pub struct LastWriterWins;

impl LinkPolicy for LastWriterWins {
    fn replace(&self, index: usize, recorded: &str, observed: &str, origin: LinkOrigin) -> bool {
        log::warn!(
            "page {index}: neighbor link mismatch ({origin:?}), replacing {recorded} with {observed}"
        );
        true
    }
}

/// Keeps the first recorded link and ignores later disagreements.
pub struct FirstWriterWins;

impl LinkPolicy for FirstWriterWins {
    fn replace(&self, index: usize, recorded: &str, observed: &str, origin: LinkOrigin) -> bool {
        log::warn!("page {index}: ignoring conflicting link {observed} ({origin:?}), keeping {recorded}");
        false
    }
}

enum Slots {
    Dense(Vec<PageEntry>),
    Sparse(HashMap<usize, PageEntry>),
}

pub struct PageTable {
    slots: Slots,
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    pub fn new() -> Self {
        PageTable {
            slots: Slots::Sparse(HashMap::new()),
        }
    }

    pub fn with_total(total: usize) -> Self {
        let mut table = PageTable::new();
        table.set_total(total);
        table
    }

    pub fn total(&self) -> Option<usize> {
        match &self.slots {
            Slots::Dense(entries) => Some(entries.len()),
            Slots::Sparse(_) => None,
        }
    }

    /// Fixes the page count, keeping whatever is already known about
    /// indices inside it.
    pub fn set_total(&mut self, total: usize) {
        let mut dense: Vec<PageEntry> = (0..total).map(PageEntry::new).collect();
        let previous = std::mem::replace(&mut self.slots, Slots::Sparse(HashMap::new()));
        let known: Vec<PageEntry> = match previous {
            Slots::Dense(entries) => entries,
            Slots::Sparse(entries) => entries.into_values().collect(),
        };
        for entry in known {
            if entry.index < total {
                let index = entry.index;
                dense[index] = entry;
            }
        }
        self.slots = Slots::Dense(dense);
    }

    pub fn contains_index(&self, index: usize) -> bool {
        self.total().is_none_or(|total| index < total)
    }

    pub fn get(&self, index: usize) -> Option<&PageEntry> {
        match &self.slots {
            Slots::Dense(entries) => entries.get(index),
            Slots::Sparse(entries) => entries.get(&index),
        }
    }

    /// Mutable access, creating the entry on first touch. `None` when the
    /// index lies beyond a known page count.
    pub fn entry(&mut self, index: usize) -> Option<&mut PageEntry> {
        match &mut self.slots {
            Slots::Dense(entries) => entries.get_mut(index),
            Slots::Sparse(entries) => Some(entries.entry(index).or_insert_with(|| PageEntry::new(index))),
        }
    }

    pub fn snapshot(&self, index: usize) -> PageEntry {
        self.get(index).cloned().unwrap_or_else(|| PageEntry::new(index))
    }

    pub fn iter_mut(&mut self) -> Box<dyn Iterator<Item = &mut PageEntry> + '_> {
        match &mut self.slots {
            Slots::Dense(entries) => Box::new(entries.iter_mut()),
            Slots::Sparse(entries) => Box::new(entries.values_mut()),
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = &PageEntry> + '_> {
        match &self.slots {
            Slots::Dense(entries) => Box::new(entries.iter()),
            Slots::Sparse(entries) => Box::new(entries.values()),
        }
    }

    /// Records the document URL of `index`. Returns whether it changed.
    pub fn record_link(
        &mut self,
        index: usize,
        url: &str,
        origin: LinkOrigin,
        policy: &dyn LinkPolicy,
    ) -> bool {
        let Some(entry) = self.entry(index) else {
            return false;
        };
        match entry.document_url.as_deref() {
            Some(current) if current == url => false,
            Some(current) => {
                if policy.replace(index, current, url, origin) {
                    entry.document_url = Some(url.to_string());
                    true
                } else {
                    false
                }
            }
            None => {
                entry.document_url = Some(url.to_string());
                true
            }
        }
    }
}
