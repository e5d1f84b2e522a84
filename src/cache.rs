use crate::error::CompileResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const CACHE_FILE: &str = "srccache.json";

#[derive(Serialize, Deserialize, Default)]
struct CacheFile {
    /// Hash of the options the entries were generated with.
    hash: String,
    entries: BTreeMap<String, String>,
}

/// One generated unit and whether it needs to go through the native compiler.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEntry {
    pub path: PathBuf,
    pub hash: String,
    pub compile: bool,
}

/// Output path to content hash, persisted next to the generated sources.
pub struct SourceCache {
    cache_path: PathBuf,
    options_hash: String,
    entries: BTreeMap<String, String>,
    force: bool,
    hits: usize,
    /// Keys written or confirmed during this run.
    touched: BTreeSet<String>,
}

impl SourceCache {
    pub fn load(dir: &Path, options_hash: &str, force: bool) -> CompileResult<Self> {
        fs::create_dir_all(dir)?;
        let cache_path = dir.join(CACHE_FILE);

        let mut entries = BTreeMap::new();
        if let Ok(data) = fs::read_to_string(&cache_path) {
            match serde_json::from_str::<CacheFile>(&data) {
                Ok(file) if file.hash == options_hash => entries = file.entries,
                Ok(_) => {
                    log::info!("[Hyperloop] options changed, resetting source cache");
                }
                Err(e) => {
                    log::warn!(
                        "[Hyperloop] ignoring unreadable source cache {}: {}",
                        cache_path.display(),
                        e
                    );
                }
            }
        }

        Ok(Self {
            cache_path,
            options_hash: options_hash.to_string(),
            entries,
            force,
            hits: 0,
            touched: BTreeSet::new(),
        })
    }

    pub fn compute_hash(source: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn key(path: &Path) -> String {
        path.to_string_lossy().replace('\\', "/")
    }

    /// Writes `code` to `path` unless the file on disk already holds exactly
    /// the recorded content.
    pub fn write_source(&mut self, path: &Path, code: &str) -> CompileResult<SourceEntry> {
        let hash = Self::compute_hash(code);
        let key = Self::key(path);

        let cached = !self.force
            && self.entries.get(&key) == Some(&hash)
            && fs::read_to_string(path)
                .map(|disk| Self::compute_hash(&disk) == hash)
                .unwrap_or(false);

        if cached {
            self.hits += 1;
            log::debug!("[Hyperloop] cached source file {}", path.display());
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, code)?;
            log::debug!("[Hyperloop] wrote source file {}", path.display());
        }
        self.touched.insert(key.clone());
        self.entries.insert(key, hash.clone());

        Ok(SourceEntry {
            path: path.to_path_buf(),
            hash,
            compile: !cached && is_compilable(path),
        })
    }

    /// Forgets `path`, so the next run rewrites and recompiles it.
    pub fn invalidate(&mut self, path: &Path) {
        self.entries.remove(&Self::key(path));
    }

    /// Drops every entry this run did not write and removes its unit from
    /// disk, so units of deleted or renamed sources do not linger.
    pub fn prune_untouched(&mut self) -> CompileResult<Vec<PathBuf>> {
        let stale: Vec<String> = self
            .entries
            .keys()
            .filter(|key| !self.touched.contains(*key))
            .cloned()
            .collect();
        let mut removed = Vec::with_capacity(stale.len());
        for key in stale {
            self.entries.remove(&key);
            let path = PathBuf::from(&key);
            match fs::remove_file(&path) {
                Ok(()) => log::debug!("[Hyperloop] removed stale source file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            removed.push(path);
        }
        Ok(removed)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(&Self::key(path))
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self) -> CompileResult<()> {
        let file = CacheFile {
            hash: self.options_hash.clone(),
            entries: self.entries.clone(),
        };
        fs::write(&self.cache_path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }
}

/// Only C-family sources go through the native compiler.
pub fn is_compilable(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("cpp" | "c" | "m" | "mm")
    )
}
