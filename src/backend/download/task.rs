use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::backend::gallery::GalleryRef;

const DEFAULT_EXTENSION: &str = "jpg";
const MAX_FOLDER_TITLE: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Stopped, never started, or left incomplete by a failure.
    #[default]
    None,
    Waiting,
    Downloading,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub gallery: GalleryRef,
    pub title: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub total_pages: Option<usize>,
    #[serde(default)]
    pub completed_pages: usize,
    #[serde(default)]
    pub state: TaskState,
    #[serde(default)]
    pub bytes_per_second: u64,
    /// Valid page files found on disk when the last run started.
    #[serde(default)]
    pub legacy_page_count: usize,
    /// Pages whose retries ran out during the last run.
    #[serde(default)]
    pub failed_pages: usize,
    /// Intermediate document URLs observed so far, by page index.
    #[serde(default)]
    pub page_links: BTreeMap<usize, String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl DownloadTask {
    pub fn new(gallery: GalleryRef, title: impl Into<String>, thumbnail_url: Option<String>) -> Self {
        DownloadTask {
            gallery,
            title: title.into(),
            thumbnail_url,
            total_pages: None,
            completed_pages: 0,
            state: TaskState::None,
            bytes_per_second: 0,
            legacy_page_count: 0,
            failed_pages: 0,
            page_links: BTreeMap::new(),
            last_error: None,
        }
    }

    pub fn gid(&self) -> u64 {
        self.gallery.gid
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, TaskState::Waiting | TaskState::Downloading)
    }

    /// Fraction of pages done, `None` while the page count is unknown.
    pub fn progress(&self) -> Option<f64> {
        match self.total_pages {
            Some(0) => Some(1.0),
            Some(total) => Some(self.completed_pages as f64 / total as f64),
            None => None,
        }
    }

    pub fn folder(&self, download_dir: &Path) -> PathBuf {
        download_dir.join(folder_name(self.gallery.gid, &self.title))
    }
}

/// `<gid>-<title>` with characters that are unsafe in file names replaced.
pub fn folder_name(gid: u64, title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_FOLDER_TITLE)
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.');
    if cleaned.is_empty() {
        gid.to_string()
    } else {
        format!("{gid}-{cleaned}")
    }
}

/// File stem of page `index`: one-based, zero-padded to five digits.
pub fn page_stem(index: usize) -> String {
    format!("{:05}", index + 1)
}

/// Page index encoded in a file stem produced by [`page_stem`].
pub fn index_from_stem(stem: &str) -> Option<usize> {
    if stem.len() != 5 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse::<usize>().ok()?.checked_sub(1)
}

/// Extension for a page file, taken from the last path segment of its image
/// URL.
pub fn image_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path.rsplit('/').next().unwrap_or(path);
    let segment = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());

    match segment.rsplit_once('.') {
        Some((_, ext))
            if (1..=4).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => DEFAULT_EXTENSION.to_string(),
    }
}

pub fn page_file_name(index: usize, image_url: &str) -> String {
    format!("{}.{}", page_stem(index), image_extension(image_url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_names_are_filesystem_safe() {
        assert_eq!(folder_name(12, "a/b: c?"), "12-a_b_ c_");
        assert_eq!(folder_name(12, "  "), "12");
        assert_eq!(folder_name(7, "Title..."), "7-Title");
    }

    #[test]
    fn page_files_round_trip_their_index() {
        assert_eq!(page_stem(0), "00001");
        assert_eq!(index_from_stem("00001"), Some(0));
        assert_eq!(index_from_stem("01024"), Some(1023));
        assert_eq!(index_from_stem("00000"), None);
        assert_eq!(index_from_stem("1"), None);
        assert_eq!(index_from_stem(".tmpA1"), None);
    }

    #[test]
    fn extension_comes_from_the_url_path() {
        assert_eq!(image_extension("https://h/x/002.PNG?dl=1"), "png");
        assert_eq!(image_extension("https://h/x/%E7%94%BB.webp"), "webp");
        assert_eq!(image_extension("https://h/keystamp=1;fileindex=2"), "jpg");
        assert_eq!(page_file_name(9, "https://h/a.gif"), "00010.gif");
    }

    #[test]
    fn old_records_without_new_fields_still_load() {
        let json = r#"{"gallery":{"gid":1,"token":"t"},"title":"x","state":"downloading"}"#;
        let task: DownloadTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.state, TaskState::Downloading);
        assert!(task.page_links.is_empty());
        assert_eq!(task.progress(), None);
    }
}
