//! Sandboxed file sharing with the inference server.
//!
//! Case files are copied into a shared root, preserving their path below
//! the dataset anchor (`<root>/<row_id>/<item>.<ext>`). The root is emptied
//! before each batch, so after [`FileShare::share`] it holds exactly the
//! current batch's files and nothing from earlier batches or other parts of
//! the dataset. Copies are read-only and never share an inode with the
//! dataset.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{GatewayError, Result};

/// Source path → sandbox path for the files of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedManifest {
    entries: BTreeMap<PathBuf, PathBuf>,
}

impl SharedManifest {
    pub fn get(&self, source: &Path) -> Option<&Path> {
        self.entries.get(source).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &Path)> {
        self.entries.iter().map(|(s, d)| (s.as_path(), d.as_path()))
    }
}

/// Exposes a bounded set of dataset files under a shared root.
pub struct FileShare {
    root: PathBuf,
    anchor: PathBuf,
}

impl FileShare {
    /// `anchor` is the dataset directory whose structure is mirrored below `root`.
    pub fn new(root: impl Into<PathBuf>, anchor: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            anchor: anchor.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location under the share root that mirrors `source`.
    pub fn shared_path(&self, source: &Path) -> Result<PathBuf> {
        let relative = source.strip_prefix(&self.anchor).map_err(|_| {
            GatewayError::missing_file(
                source,
                format!("outside of dataset root {}", self.anchor.display()),
            )
        })?;
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(GatewayError::missing_file(source, "path escapes dataset root"));
        }
        Ok(self.root.join(relative))
    }

    /// Replace the shared content with exactly `paths`.
    ///
    /// Every file is checked before anything is exposed; a missing or
    /// unreadable file fails the whole batch.
    pub fn share(&mut self, paths: &[PathBuf]) -> Result<SharedManifest> {
        let mut entries = BTreeMap::new();
        for source in paths {
            let dest = self.shared_path(source)?;
            let metadata =
                fs::metadata(source).map_err(|e| GatewayError::missing_file(source, e))?;
            if !metadata.is_file() {
                return Err(GatewayError::missing_file(source, "not a regular file"));
            }
            entries.insert(source.clone(), dest);
        }

        self.clear()?;
        fs::create_dir_all(&self.root)?;

        for (source, dest) in &entries {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            if let Err(e) = mirror(source, dest) {
                let _ = self.clear();
                return Err(GatewayError::missing_file(source, e));
            }
        }

        tracing::debug!(
            files = entries.len(),
            root = %self.root.display(),
            "Shared batch files"
        );

        Ok(SharedManifest { entries })
    }

    /// Remove everything below the share root, keeping the root itself.
    pub fn clear(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Copy `source` to `dest` and drop the copy's write bits.
fn mirror(source: &Path, dest: &Path) -> std::io::Result<()> {
    fs::copy(source, dest)?;
    let mut permissions = fs::metadata(dest)?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(dest, permissions)
}
