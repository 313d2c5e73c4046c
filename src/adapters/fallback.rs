//! Filesystem Fallback Store Adapter
//!
//! Substitute for the object store when it is unreachable. Blobs live
//! under a configurable root in the same scoped `templates/...` layout the
//! object store uses, so a `fallback://` path and an `s3://` key name the
//! same logical object.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::ports::FallbackStore;
use crate::error::{Error, Result};

/// Filesystem-backed fallback store.
#[derive(Debug, Clone)]
pub struct FsFallbackStore {
    root: PathBuf,
}

impl FsFallbackStore {
    /// Create a fallback store rooted at the given directory, creating it
    /// if needed.
    pub async fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        info!(path = %root.display(), "Initialized fallback store");
        Ok(Self { root })
    }

    /// Fallback store in a fresh temp directory (for tests and local dev).
    pub fn new_temp() -> Self {
        let root = std::env::temp_dir().join(format!("cardstor-fallback-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).ok();
        Self { root }
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative storage key against the root, rejecting paths
    /// that would escape it.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let key = key.trim_start_matches('/');
        if key.is_empty() {
            return Err(Error::InvalidUrl("empty fallback path".to_string()));
        }
        if key.split('/').any(|segment| segment == "..") {
            return Err(Error::InvalidUrl(format!(
                "fallback path escapes store root: {}",
                key
            )));
        }
        Ok(self.root.join(key))
    }

    async fn write_file(&self, key: &str, data: Bytes) -> Result<String> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &data).await?;
        debug!(path = %path.display(), bytes = data.len(), "Wrote fallback blob");
        Ok(key.to_string())
    }

    async fn read_file(&self, key: &str) -> Result<Bytes> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ResourceNotFound(format!("fallback://{}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_file(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // Deleting an already-absent blob is a no-op
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl FallbackStore for FsFallbackStore {
    async fn save_template(&self, key: &str, data: Bytes) -> Result<String> {
        self.write_file(key, data).await
    }

    #[instrument(skip(self))]
    async fn load_template(&self, path: &str) -> Result<Bytes> {
        match self.read_file(path).await {
            Err(Error::ResourceNotFound(_)) => {
                Err(Error::TemplateNotFound(format!("fallback://{}", path)))
            }
            other => other,
        }
    }

    async fn delete_template(&self, path: &str) -> Result<()> {
        self.remove_file(path).await
    }

    async fn save_resource(&self, key: &str, data: Bytes) -> Result<String> {
        self.write_file(key, data).await
    }

    #[instrument(skip(self))]
    async fn load_resource(&self, path: &str) -> Result<Bytes> {
        self.read_file(path).await
    }

    async fn delete_resource(&self, path: &str) -> Result<()> {
        self.remove_file(path).await
    }

    /// Writability probe: create and remove a marker file under the root.
    async fn check_writable(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let probe = self.root.join(format!(".writable-{}", Uuid::new_v4()));
        fs::write(&probe, b"probe").await?;
        fs::remove_file(&probe).await?;
        Ok(())
    }

    async fn free_space_bytes(&self) -> Option<u64> {
        free_space(&self.root).await
    }
}

/// Best-effort free-space measurement for the filesystem holding `path`.
#[cfg(unix)]
async fn free_space(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    tokio::task::spawn_blocking(move || {
        let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
        if rc == 0 {
            Some(stats.f_bavail as u64 * stats.f_frsize as u64)
        } else {
            None
        }
    })
    .await
    .ok()
    .flatten()
}

#[cfg(not(unix))]
async fn free_space(_path: &Path) -> Option<u64> {
    None
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = FsFallbackStore::new_temp();
        let data = Bytes::from_static(b"{\"elements\":[]}");

        let path = store
            .save_template("templates/u1/p1/card-a/template.json", data.clone())
            .await
            .unwrap();
        assert_eq!(path, "templates/u1/p1/card-a/template.json");

        let loaded = store.load_template(&path).await.unwrap();
        assert_eq!(loaded, data);
    }

    #[tokio::test]
    async fn test_load_missing_template_is_not_found() {
        let store = FsFallbackStore::new_temp();
        let err = store.load_template("templates/u1/p1/x/template.json").await;
        assert!(matches!(err, Err(Error::TemplateNotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = FsFallbackStore::new_temp();
        store
            .save_resource("templates/u1/p1/a/logo.png", Bytes::from_static(b"png"))
            .await
            .unwrap();
        store.delete_resource("templates/u1/p1/a/logo.png").await.unwrap();
        // Second delete of the same path still succeeds
        store.delete_resource("templates/u1/p1/a/logo.png").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let store = FsFallbackStore::new_temp();
        let result = store
            .save_resource("templates/../../etc/passwd", Bytes::from_static(b"x"))
            .await;
        assert!(matches!(result, Err(Error::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_writability_probe() {
        let store = FsFallbackStore::new_temp();
        store.check_writable().await.unwrap();
        // Probe leaves no marker files behind
        let mut entries = fs::read_dir(store.root()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name());
        }
        assert!(names.iter().all(|n| !n.to_string_lossy().starts_with(".writable-")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_free_space_reports_on_unix() {
        let store = FsFallbackStore::new_temp();
        let free = store.free_space_bytes().await;
        assert!(free.is_some());
    }
}
