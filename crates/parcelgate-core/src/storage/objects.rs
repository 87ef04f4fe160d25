//! Durable object writer
//!
//! Byte blobs under `/`-separated string keys, scoped to a root directory.
//! Every write lands in a temporary sibling first, is flushed with
//! `sync_all`, renamed into place and followed by a best-effort fsync of
//! the parent directory, so a crash leaves either the old or the new file.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;

/// Suffix of in-flight temporary files; never listed.
const TEMP_SUFFIX: &str = ".tmp";

/// Atomic, fsync-durable blob storage rooted at a directory
#[derive(Debug, Clone)]
pub struct ObjectWriter {
    root: PathBuf,
}

impl ObjectWriter {
    /// Create a writer rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory of this writer
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path inside the root.
    ///
    /// Only plain path segments are accepted; `..`, `.`, absolute paths and
    /// empty keys are rejected.
    pub fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.contains('\\') {
            return Err(StoreError::KeyOutsideRoot(key.to_string()));
        }
        let relative = Path::new(key);
        let mut path = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => path.push(segment),
                _ => return Err(StoreError::KeyOutsideRoot(key.to_string())),
            }
        }
        if path == self.root {
            return Err(StoreError::KeyOutsideRoot(key.to_string()));
        }
        Ok(path)
    }

    /// Durably write `data` under `key`, replacing any previous content.
    pub async fn write(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::KeyOutsideRoot(key.to_string()))?
            .to_path_buf();
        fs::create_dir_all(&parent).await?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StoreError::KeyOutsideRoot(key.to_string()))?;
        let tmp_path = parent.join(format!(".{}.{}{}", file_name, ulid::Ulid::new(), TEMP_SUFFIX));

        let result = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp_path, &path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        fsync_dir(&parent).await.ok();
        Ok(())
    }

    /// Read the blob under `key`; `None` if it does not exist.
    pub async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the blob under `key`. Deleting a missing key is not an error.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a blob exists under `key`
    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.resolve(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Last modification time of the blob under `key`; `None` if missing.
    pub async fn modified(&self, key: &str) -> Result<Option<SystemTime>, StoreError> {
        let path = self.resolve(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List every key below `prefix`, sorted.
    ///
    /// Returned keys include the prefix. A missing prefix directory yields
    /// an empty list. Temporary files are skipped.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let base = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix)?
        };

        let mut keys = Vec::new();
        let mut pending = vec![(base, prefix.trim_end_matches('/').to_string())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let key = if key_prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", key_prefix, name)
                };
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else if !(name.starts_with('.') && name.ends_with(TEMP_SUFFIX)) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(unix)]
async fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    let dir = fs::File::open(dir).await?;
    dir.sync_all().await
}

#[cfg(not(unix))]
async fn fsync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
