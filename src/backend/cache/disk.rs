//! Disk tier: one checksummed file per key under a sharded directory.
//!
//! Layout: `<root>/<2 hex>/<62 hex>.bin`, named after the sha256 of the key.
//! Each file starts with a fixed header (magic, payload length, sha256 of the
//! payload). Anything that fails to verify is a miss and is deleted.

use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;

use crate::backend::error::{PipelineError, Result};

const MAGIC: &[u8; 8] = b"EHVCACH1";
const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + 8 + DIGEST_LEN;
const SHARD_LEN: usize = 2;

struct DiskMeta {
    size: u64,
    last_access: u64,
}

#[derive(Default)]
struct DiskIndex {
    entries: HashMap<PathBuf, DiskMeta>,
    bytes_used: u64,
    clock: u64,
}

impl DiskIndex {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn record(&mut self, path: PathBuf, size: u64) {
        let last_access = self.tick();
        if let Some(old) = self.entries.insert(path, DiskMeta { size, last_access }) {
            self.bytes_used = self.bytes_used.saturating_sub(old.size);
        }
        self.bytes_used += size;
    }

    fn touch(&mut self, path: &Path) {
        let now = self.tick();
        if let Some(meta) = self.entries.get_mut(path) {
            meta.last_access = now;
        }
    }

    fn forget(&mut self, path: &Path) {
        if let Some(old) = self.entries.remove(path) {
            self.bytes_used = self.bytes_used.saturating_sub(old.size);
        }
    }

    /// Oldest entries that must go for `budget` to hold, never `keep`.
    fn victims(&self, budget: u64, keep: &Path) -> Vec<PathBuf> {
        if self.bytes_used <= budget {
            return Vec::new();
        }
        let mut by_age: Vec<(&PathBuf, &DiskMeta)> =
            self.entries.iter().filter(|(p, _)| p.as_path() != keep).collect();
        by_age.sort_by_key(|(_, meta)| meta.last_access);

        let mut used = self.bytes_used;
        let mut victims = Vec::new();
        for (path, meta) in by_age {
            if used <= budget {
                break;
            }
            used = used.saturating_sub(meta.size);
            victims.push(path.clone());
        }
        victims
    }
}

pub struct DiskTier {
    root: PathBuf,
    budget: u64,
    index: Mutex<DiskIndex>,
}

impl DiskTier {
    /// Opens (or creates) the tier at `root`, rebuilding the size and access
    /// index from what is already on disk.
    pub fn open(root: impl Into<PathBuf>, budget: u64) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut found = Vec::new();
        for shard in fs::read_dir(&root)?.filter_map(|e| e.ok()) {
            if !shard.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            for entry in fs::read_dir(shard.path())?.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                    // Leftover temp file from an interrupted write.
                    let _ = fs::remove_file(&path);
                    continue;
                }
                if let Ok(meta) = entry.metadata() {
                    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    found.push((path, meta.len(), modified));
                }
            }
        }
        found.sort_by_key(|(_, _, modified)| *modified);

        let mut index = DiskIndex::default();
        for (path, size, _) in found {
            index.record(path, size);
        }
        log::debug!(
            "disk cache at {} holds {} entries ({} bytes)",
            root.display(),
            index.entries.len(),
            index.bytes_used
        );

        let tier = DiskTier {
            root,
            budget,
            index: Mutex::new(index),
        };
        tier.evict_over_budget(Path::new(""));
        Ok(tier)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bytes_used(&self) -> u64 {
        self.index.lock().bytes_used
    }

    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let hex = format!("{:x}", Sha256::digest(key.as_bytes()));
        let (shard, rest) = hex.split_at(SHARD_LEN);
        self.root.join(shard).join(format!("{rest}.bin"))
    }

    /// Reads and verifies the entry for `key`. Corrupt entries are removed
    /// and reported as absent.
    pub fn read(&self, key: &str) -> Option<Bytes> {
        let path = self.path_for(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("disk cache read {} failed: {}", path.display(), e);
                }
                self.index.lock().forget(&path);
                return None;
            }
        };

        match decode_entry(&raw) {
            Some(payload) => {
                self.index.lock().touch(&path);
                touch_mtime(&path);
                Some(Bytes::copy_from_slice(payload))
            }
            None => {
                log::warn!("disk cache entry {} is corrupt, evicting", path.display());
                let _ = fs::remove_file(&path);
                self.index.lock().forget(&path);
                None
            }
        }
    }

    /// Atomically writes `bytes` for `key`, then evicts old entries until
    /// the tier fits its budget again.
    pub fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let size = (HEADER_LEN + bytes.len()) as u64;
        if size > self.budget {
            // Too big to keep; the previous value must not outlive it.
            return self.remove(key);
        }

        let path = self.path_for(key);
        let parent = path
            .parent()
            .ok_or_else(|| PipelineError::storage(format!("{} has no parent", path.display())))?;
        fs::create_dir_all(parent)?;

        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&encode_header(bytes))?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| PipelineError::Io(e.error))?;

        self.index.lock().record(path.clone(), size);
        self.evict_over_budget(&path);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        self.index.lock().forget(&path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn evict_over_budget(&self, keep: &Path) {
        let victims = {
            let mut index = self.index.lock();
            let victims = index.victims(self.budget, keep);
            for path in &victims {
                index.forget(path);
            }
            victims
        };
        for path in victims {
            log::debug!("disk cache evicting {}", path.display());
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("could not evict {}: {}", path.display(), e);
                }
            }
        }
    }
}

fn encode_header(payload: &[u8]) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(MAGIC);
    header.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    header.extend_from_slice(&Sha256::digest(payload));
    header
}

fn decode_entry(raw: &[u8]) -> Option<&[u8]> {
    if raw.len() < HEADER_LEN || &raw[..MAGIC.len()] != MAGIC {
        return None;
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&raw[MAGIC.len()..MAGIC.len() + 8]);
    let len = u64::from_le_bytes(len_bytes) as usize;

    let digest = &raw[MAGIC.len() + 8..HEADER_LEN];
    let payload = &raw[HEADER_LEN..];
    if payload.len() != len || Sha256::digest(payload).as_slice() != digest {
        return None;
    }
    Some(payload)
}

fn touch_mtime(path: &Path) {
    if let Ok(file) = fs::File::options().write(true).open(path) {
        let _ = file.set_modified(SystemTime::now());
    }
}
