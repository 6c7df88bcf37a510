//! Filesystem driver.
//!
//! A writer streams into a hidden temporary sibling of the target. Commit
//! fsyncs the temporary file and hard-links it to the target name; `link(2)`
//! fails atomically when the target exists, which is the create-if-absent
//! primitive. The temporary file is removed whether or not the link succeeds.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{page_names, validate_name, CommitReceipt, ConditionalStore, ObjectWriter};
use crate::codec::Crc32cAccumulator;
use crate::error::{Error, Result, StoreError};

/// Prefix of in-progress temporary files; never a valid object name.
const TEMP_PREFIX: &str = ".packtmp-";

/// Buffered bytes are pushed to the temporary file past this size.
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Conditional store over a local directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    dir: PathBuf,
}

impl FsStore {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(StoreError::from)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(name))
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::result::Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking storage task failed: {e}")))?
        .map_err(Error::from)
}

#[async_trait]
impl ConditionalStore for FsStore {
    async fn open_for_create(&self, name: &str) -> Result<Box<dyn ObjectWriter>> {
        let target = self.path(name)?;
        let dir = self.dir.clone();
        let owned = name.to_string();
        let temp = blocking(move || {
            tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempfile_in(&dir)
                .map_err(|e| match e.kind() {
                    io::ErrorKind::AlreadyExists => StoreError::AlreadyOpening(owned),
                    _ => StoreError::from(e),
                })
        })
        .await?;
        debug!(name, temp = %temp.path().display(), "opened object for create");
        Ok(Box::new(FsObjectWriter {
            name: name.to_string(),
            target,
            dir: self.dir.clone(),
            temp: Some(temp),
            pending: Vec::new(),
            crc: Crc32cAccumulator::new(),
        }))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.path(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::from(e).into()),
        }
    }

    async fn read(&self, name: &str) -> Result<Bytes> {
        let path = self.path(name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()).into())
            }
            Err(e) => Err(StoreError::from(e).into()),
        }
    }

    async fn list_after(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let dir = self.dir.clone();
        let prefix = prefix.to_string();
        let names = blocking(move || {
            let mut names = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                if name.starts_with(&prefix) && !name.starts_with(TEMP_PREFIX) {
                    names.push(name);
                }
            }
            Ok(names)
        })
        .await?;
        Ok(page_names(names, start_after, limit))
    }

    fn describe(&self) -> String {
        format!("file://{}", self.dir.display())
    }
}

struct FsObjectWriter {
    name: String,
    target: PathBuf,
    dir: PathBuf,
    /// Taken while a blocking task owns the file.
    temp: Option<NamedTempFile>,
    pending: Vec<u8>,
    crc: Crc32cAccumulator,
}

impl FsObjectWriter {
    async fn flush_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut temp = self
            .temp
            .take()
            .ok_or_else(|| StoreError::Io("writer lost its temporary file".into()))?;
        let buf = std::mem::take(&mut self.pending);
        let temp = blocking(move || {
            temp.write_all(&buf)?;
            Ok(temp)
        })
        .await?;
        self.temp = Some(temp);
        Ok(())
    }
}

#[async_trait]
impl ObjectWriter for FsObjectWriter {
    async fn write_checksummed(&mut self, bytes: &[u8], crc32c: u32) -> Result<()> {
        self.pending.extend_from_slice(bytes);
        self.crc.update_checksummed(crc32c, bytes.len() as u64);
        if self.pending.len() >= FLUSH_THRESHOLD {
            self.flush_pending().await?;
        }
        Ok(())
    }

    fn checksum(&self) -> u32 {
        self.crc.value()
    }

    fn len(&self) -> u64 {
        self.crc.len()
    }

    async fn commit_if_absent(mut self: Box<Self>) -> Result<CommitReceipt> {
        self.flush_pending().await?;
        let temp = self
            .temp
            .take()
            .ok_or_else(|| StoreError::Io("writer lost its temporary file".into()))?;
        let target = self.target.clone();
        let dir = self.dir.clone();
        let name = self.name.clone();

        // `temp` is dropped (and unlinked) at the end of the closure either way.
        blocking(move || {
            temp.as_file().sync_all()?;
            match std::fs::hard_link(temp.path(), &target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(StoreError::AlreadyExists(name));
                }
                Err(e) => return Err(e.into()),
            }
            sync_dir(&dir);
            Ok(())
        })
        .await?;

        debug!(name = %self.name, size = self.crc.len(), "committed object");
        Ok(CommitReceipt {
            name: self.name.clone(),
            size: self.crc.len(),
            crc32c: self.crc.value(),
        })
    }
}

/// Persist the new directory entry. Best effort: the object is already
/// visible, and some platforms cannot open directories.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Err(e) = std::fs::File::open(dir).and_then(|d| d.sync_all()) {
        warn!(dir = %dir.display(), error = %e, "directory fsync failed");
    }
    #[cfg(not(unix))]
    let _ = dir;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{check_conditional_semantics, check_single_winner};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fs_conditional_semantics() {
        let dir = tempfile::tempdir().unwrap();
        check_conditional_semantics(Arc::new(FsStore::new(dir.path()).unwrap())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fs_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        check_single_winner(Arc::new(FsStore::new(dir.path()).unwrap())).await;
    }

    #[tokio::test]
    async fn test_temp_files_cleaned_and_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();

        let mut open = store.open_for_create("a").await.unwrap();
        open.write(b"pending").await.unwrap();
        // the open writer's temp file is on disk but not listed
        assert!(store.list_after("", None, 10).await.unwrap().is_empty());

        let mut winner = store.open_for_create("a").await.unwrap();
        winner.write(b"first").await.unwrap();
        winner.commit_if_absent().await.unwrap();
        assert!(open.commit_if_absent().await.is_err());

        let on_disk: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(on_disk, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_large_object_streams_through_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        let chunk = vec![7u8; 10_000];
        let mut w = store.open_for_create("big").await.unwrap();
        for _ in 0..20 {
            w.write(&chunk).await.unwrap();
        }
        let receipt = w.commit_if_absent().await.unwrap();
        assert_eq!(receipt.size, 200_000);
        let body = store.read("big").await.unwrap();
        assert_eq!(body.len(), 200_000);
        assert_eq!(receipt.crc32c, crate::codec::crc32c(&body));
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.open_for_create("../escape").await,
            Err(Error::Storage(StoreError::InvalidName(_)))
        ));
        assert!(store.exists(".packtmp-x").await.is_err());
    }
}
