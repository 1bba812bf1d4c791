use std::path::{Path, PathBuf};

use async_trait::async_trait;
use murmur_shared::constants::{MAX_EXTENSION_LEN, UPLOAD_STEM, UPLOAD_URL_PREFIX};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::services::{FileStore, FileStoreError, StoredFile};

/// Attempts at picking a free name before giving up.
const MAX_NAME_ATTEMPTS: usize = 8;

/// Extension of a client-declared file name. Everything but the extension is
/// discarded; a name without one yields an empty string.
pub fn upload_extension(declared: &str) -> Result<String, FileStoreError> {
    let Some(ext) = Path::new(declared).extension() else {
        return Ok(String::new());
    };
    let ext = ext
        .to_str()
        .ok_or_else(|| FileStoreError::Rejected("extension is not valid UTF-8".into()))?;

    if ext.len() > MAX_EXTENSION_LEN || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(FileStoreError::Rejected(format!(
            "unsupported file extension '{ext}'"
        )));
    }
    Ok(ext.to_string())
}

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, FileStoreError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            std::path::Component::Normal(c) => resolved.push(c),
            std::path::Component::ParentDir => {
                return Err(FileStoreError::Rejected("path traversal detected".into()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(FileStoreError::Rejected("path traversal detected".into()));
    }
    Ok(resolved)
}

/// Uploads written as opaque files under one directory. Stored names are
/// `file.<ext>`, falling back to `file_<suffix>.<ext>` when taken.
#[derive(Debug, Clone)]
pub struct DiskFileStore {
    base_path: PathBuf,
    max_size: usize,
}

impl DiskFileStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, FileStoreError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            FileStoreError::Storage(format!(
                "failed to create upload directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Upload store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    /// Read a stored upload back by its final name.
    pub async fn open(&self, name: &str) -> Result<Option<Vec<u8>>, FileStoreError> {
        let path = self.safe_path(name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FileStoreError::Storage(format!(
                "failed to read upload {name}: {e}"
            ))),
        }
    }

    fn safe_path(&self, name: &str) -> Result<PathBuf, FileStoreError> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(FileStoreError::Rejected("path traversal detected".into()));
        }
        ensure_within(&self.base_path, &self.base_path.join(name))
    }

    fn candidate_name(attempt: usize, extension: &str) -> String {
        let stem = if attempt == 0 {
            UPLOAD_STEM.to_string()
        } else {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("{UPLOAD_STEM}_{}", &suffix[..8])
        };
        if extension.is_empty() {
            stem
        } else {
            format!("{stem}.{extension}")
        }
    }
}

#[async_trait]
impl FileStore for DiskFileStore {
    async fn store(&self, blob: &[u8], extension: &str) -> Result<StoredFile, FileStoreError> {
        if blob.is_empty() {
            return Err(FileStoreError::Rejected("empty upload".into()));
        }
        if blob.len() > self.max_size {
            return Err(FileStoreError::TooLarge {
                size: blob.len(),
                max: self.max_size,
            });
        }
        if !extension.is_empty() {
            upload_extension(&format!("{UPLOAD_STEM}.{extension}"))?;
        }

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = Self::candidate_name(attempt, extension);
            let path = self.safe_path(&name)?;

            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(FileStoreError::Storage(format!(
                        "failed to create {name}: {e}"
                    )))
                }
            };

            let written = async {
                file.write_all(blob).await?;
                file.flush().await
            }
            .await;
            if let Err(e) = written {
                let _ = fs::remove_file(&path).await;
                return Err(FileStoreError::Storage(format!(
                    "failed to write {name}: {e}"
                )));
            }

            debug!(name = %name, size = blob.len(), "Stored upload");
            return Ok(StoredFile {
                reference: format!("{UPLOAD_URL_PREFIX}/{name}"),
                final_name: name,
            });
        }

        Err(FileStoreError::Storage(
            "could not find a free upload name".into(),
        ))
    }

    async fn discard(&self, file: &StoredFile) -> Result<(), FileStoreError> {
        let path = self.safe_path(&file.final_name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(name = %file.final_name, "Discarded upload");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FileStoreError::Storage(format!(
                "failed to delete {}: {e}",
                file.final_name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (DiskFileStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = DiskFileStore::new(dir.path().to_path_buf(), 1024)
            .await
            .unwrap();
        (store, dir)
    }

    #[test]
    fn extension_only_survives() {
        assert_eq!(upload_extension("secret.png").unwrap(), "png");
        assert_eq!(upload_extension("archive.tar.gz").unwrap(), "gz");
        assert_eq!(upload_extension("../../etc/passwd.txt").unwrap(), "txt");
        assert_eq!(upload_extension("README").unwrap(), "");
        assert!(upload_extension("evil.p$p").is_err());
        assert!(upload_extension(&format!("x.{}", "a".repeat(40))).is_err());
    }

    #[tokio::test]
    async fn store_and_open() {
        let (store, _dir) = test_store().await;

        let stored = store.store(b"ciphertext", "png").await.unwrap();
        assert_eq!(stored.final_name, "file.png");
        assert_eq!(stored.reference, "uploads/file.png");

        let data = store.open(&stored.final_name).await.unwrap();
        assert_eq!(data.as_deref(), Some(&b"ciphertext"[..]));
    }

    #[tokio::test]
    async fn colliding_names_get_a_suffix() {
        let (store, _dir) = test_store().await;

        let first = store.store(b"one", "png").await.unwrap();
        let second = store.store(b"two", "png").await.unwrap();

        assert_ne!(first.final_name, second.final_name);
        assert!(second.final_name.starts_with("file_"));
        assert!(second.final_name.ends_with(".png"));
        assert_eq!(store.open(&first.final_name).await.unwrap().unwrap(), b"one");
        assert_eq!(store.open(&second.final_name).await.unwrap().unwrap(), b"two");
    }

    #[tokio::test]
    async fn empty_and_oversized_uploads_are_rejected() {
        let (store, _dir) = test_store().await;

        assert!(matches!(
            store.store(b"", "png").await,
            Err(FileStoreError::Rejected(_))
        ));
        assert!(matches!(
            store.store(&[0u8; 2048], "png").await,
            Err(FileStoreError::TooLarge { size: 2048, max: 1024 })
        ));
    }

    #[tokio::test]
    async fn discard_removes_and_tolerates_missing() {
        let (store, _dir) = test_store().await;
        let stored = store.store(b"bye", "").await.unwrap();
        assert_eq!(stored.final_name, "file");

        store.discard(&stored).await.unwrap();
        assert!(store.open(&stored.final_name).await.unwrap().is_none());
        store.discard(&stored).await.unwrap();
    }

    #[tokio::test]
    async fn traversal_is_refused() {
        let (store, _dir) = test_store().await;
        assert!(store.open("../secret").await.is_err());
        assert!(store.open("a/b").await.is_err());
    }
}
