//! File-backed capture registry.
//!
//! Layout under the capture root:
//!
//! ```text
//! {root}/{namespace}/{capture_name}/{workload}_{device}.json
//! ```
//!
//! The JSON file holds the running specification; the capture writer drops
//! its output next to it using the same `{workload}_` prefix.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::{debug, info};

use super::{CaptureError, CaptureKey, CaptureRegistry, Result, Specification};

const TMP_SUFFIX: &str = ".tmp";

/// Accept `name` as a single path component below the capture root.
fn path_component(name: &str) -> Result<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(CaptureError::InvalidName(name.to_string()));
    }
    Ok(name)
}

pub struct ActiveCaptures {
    root: PathBuf,
    active: HashMap<CaptureKey, Specification>,
}

impl ActiveCaptures {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            active: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Directory shared by every endpoint of one capture resource.
    fn capture_dir(&self, key: &CaptureKey) -> Result<PathBuf> {
        Ok(self
            .root
            .join(path_component(&key.namespace)?)
            .join(path_component(&key.capture_name)?))
    }

    /// Prefix of every file belonging to `key` inside its capture directory.
    fn file_prefix(key: &CaptureKey) -> String {
        format!("{}_", key.workload_endpoint.as_str().replace('/', "-"))
    }

    fn spec_file(&self, key: &CaptureKey, spec: &Specification) -> Result<PathBuf> {
        let device = path_component(&spec.device_name)?;
        Ok(self
            .capture_dir(key)?
            .join(format!("{}{}.json", Self::file_prefix(key), device)))
    }

    fn write_spec(&self, key: &CaptureKey, spec: &Specification) -> Result<()> {
        let path = self.spec_file(key, spec)?;
        let dir = self.capture_dir(key)?;
        fs::create_dir_all(&dir).map_err(|source| CaptureError::Io {
            path: dir.clone(),
            source,
        })?;

        let tmp = path.with_extension(format!("json{}", TMP_SUFFIX));
        let data = serde_json::to_vec_pretty(spec)?;
        fs::write(&tmp, data).map_err(|source| CaptureError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| CaptureError::Io {
            path: path.clone(),
            source,
        })
    }

    /// Delete every file of `key`, then the capture directory if that left
    /// it empty. Missing files are fine.
    fn clean(&self, key: &CaptureKey) -> Result<()> {
        // A key that can't name a directory never had files written.
        let Ok(dir) = self.capture_dir(key) else {
            return Ok(());
        };
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(CaptureError::Io { path: dir, source }),
        };

        let prefix = Self::file_prefix(key);
        for entry in entries {
            let entry = entry.map_err(|source| CaptureError::Io {
                path: dir.clone(),
                source,
            })?;
            if !entry.file_name().to_string_lossy().starts_with(&prefix) {
                continue;
            }
            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed capture file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(CaptureError::Io { path, source }),
            }
        }

        // Other endpoints of the same capture may still own files here.
        match fs::remove_dir(&dir) {
            Ok(()) => Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::DirectoryNotEmpty
                ) =>
            {
                Ok(())
            }
            Err(source) => Err(CaptureError::Io { path: dir, source }),
        }
    }
}

impl CaptureRegistry for ActiveCaptures {
    fn contains(&self, key: &CaptureKey) -> Option<Specification> {
        self.active.get(key).cloned()
    }

    fn add(&mut self, key: &CaptureKey, spec: Specification) -> Result<()> {
        if self.active.contains_key(key) {
            return Err(CaptureError::AlreadyActive(key.clone()));
        }
        self.write_spec(key, &spec)?;
        self.active.insert(key.clone(), spec);
        Ok(())
    }

    fn remove(&mut self, key: &CaptureKey) -> Option<Specification> {
        self.active.remove(key)
    }

    fn remove_and_clean(&mut self, key: &CaptureKey) -> Result<Option<Specification>> {
        let removed = self.active.remove(key);
        if let Err(e) = self.clean(key) {
            // Keep the entry so the next attempt still sees it as running.
            if let Some(spec) = removed {
                self.active.insert(key.clone(), spec);
            }
            return Err(e);
        }
        Ok(removed)
    }
}

/// Remove leftovers of interrupted writes and empty capture directories
/// below `root`. Returns the number of entries removed.
pub async fn purge_orphans(root: PathBuf) -> io::Result<usize> {
    let mut removed = 0;
    let mut namespaces = match tokio::fs::read_dir(&root).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    while let Some(ns) = namespaces.next_entry().await? {
        if !ns.file_type().await?.is_dir() {
            continue;
        }
        let mut captures = tokio::fs::read_dir(ns.path()).await?;
        while let Some(capture) = captures.next_entry().await? {
            if !capture.file_type().await?.is_dir() {
                continue;
            }
            let dir = capture.path();
            let mut files = tokio::fs::read_dir(&dir).await?;
            let mut remaining = 0;
            while let Some(file) = files.next_entry().await? {
                if file.file_name().to_string_lossy().ends_with(TMP_SUFFIX) {
                    tokio::fs::remove_file(file.path()).await?;
                    removed += 1;
                } else {
                    remaining += 1;
                }
            }
            if remaining == 0 {
                tokio::fs::remove_dir(&dir).await?;
                removed += 1;
            }
        }
    }

    if removed > 0 {
        info!(root = %root.display(), removed, "Purged orphaned capture files");
    }
    Ok(removed)
}
