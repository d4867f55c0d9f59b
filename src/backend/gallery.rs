use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::Result;

/// Identity of a remote gallery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GalleryRef {
    pub gid: u64,
    pub token: String,
}

impl GalleryRef {
    pub fn new(gid: u64, token: impl Into<String>) -> Self {
        GalleryRef {
            gid,
            token: token.into(),
        }
    }
}

impl fmt::Display for GalleryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.gid, self.token)
    }
}

/// What the gallery's own document tells us before any page is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryDetail {
    pub title: String,
    pub total_pages: usize,
    pub first_page_url: Option<String>,
}

/// The parsed intermediate document of a single page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDocument {
    pub image_url: String,
    pub prev_url: Option<String>,
    pub next_url: Option<String>,
}

/// Site-specific knowledge: how URLs are built and how documents are read.
///
/// Implementations do no I/O; the resolver fetches and hands them bodies.
pub trait GallerySource: Send + Sync {
    fn gallery_url(&self, gallery: &GalleryRef) -> String;

    fn parse_gallery(&self, gallery: &GalleryRef, body: &str) -> Result<GalleryDetail>;

    /// Best guess at the intermediate document of `index`. Observed neighbor
    /// links take precedence over this.
    fn page_document_url(&self, gallery: &GalleryRef, index: usize) -> String;

    fn parse_page_document(&self, body: &str) -> Result<PageDocument>;
}
