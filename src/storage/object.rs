//! `object_store` driver.
//!
//! Writers buffer the whole object in memory and commit it with a single
//! `PutMode::Create` put. The backend's "already exists" and "precondition
//! failed" responses both surface as [`StoreError::AlreadyExists`].
//!
//! S3, GCS, Azure and the in-memory store list keys in lexicographic order,
//! so a listing stops at `limit` matches or at the first key past the
//! prefix range. Backends without ordered listings (the local filesystem)
//! must be built with [`ObjectStoreDriver::with_unordered_listing`], which
//! scans to the end.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions};
use std::sync::Arc;
use tracing::debug;

use super::{page_names, validate_name, CommitReceipt, ConditionalStore, ObjectWriter};
use crate::codec::Crc32cAccumulator;
use crate::error::{Result, StoreError};

/// Conditional store over any [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct ObjectStoreDriver {
    store: Arc<dyn ObjectStore>,
    /// Objects live directly under this path.
    root: Path,
    ordered_listing: bool,
}

impl ObjectStoreDriver {
    pub fn new(store: Arc<dyn ObjectStore>, root: impl Into<Path>) -> Self {
        Self {
            store,
            root: root.into(),
            ordered_listing: true,
        }
    }

    /// For backends whose listings come back in no particular order.
    pub fn with_unordered_listing(mut self) -> Self {
        self.ordered_listing = false;
        self
    }

    /// Backed by a fresh in-process store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), Path::default())
    }

    fn path(&self, name: &str) -> std::result::Result<Path, StoreError> {
        validate_name(name)?;
        Ok(self.root.child(name))
    }
}

fn map_err(name: &str, e: object_store::Error) -> StoreError {
    match e {
        object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. } => {
            StoreError::AlreadyExists(name.to_string())
        }
        object_store::Error::NotFound { .. } => StoreError::NotFound(name.to_string()),
        other => StoreError::Io(other.to_string()),
    }
}

#[async_trait]
impl ConditionalStore for ObjectStoreDriver {
    async fn open_for_create(&self, name: &str) -> Result<Box<dyn ObjectWriter>> {
        let path = self.path(name)?;
        Ok(Box::new(BufferedObjectWriter {
            store: self.store.clone(),
            path,
            name: name.to_string(),
            buf: BytesMut::new(),
            crc: Crc32cAccumulator::new(),
        }))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.path(name)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(map_err(name, e).into()),
        }
    }

    async fn read(&self, name: &str) -> Result<Bytes> {
        let path = self.path(name)?;
        let result = self.store.get(&path).await.map_err(|e| map_err(name, e))?;
        Ok(result.bytes().await.map_err(|e| map_err(name, e))?)
    }

    async fn list_after(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        // Listing prefixes are path segments in object_store, so list the
        // root from an offset and match names by string prefix.
        let offset = self.root.child(start_after.unwrap_or(prefix));
        let range = self.root.child(prefix);
        let mut stream = self.store.list_with_offset(Some(&self.root), &offset);
        let mut names = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(|e| map_err(prefix, e))?;
            if self.ordered_listing {
                let location: &str = meta.location.as_ref();
                let range: &str = range.as_ref();
                if !location.starts_with(range) && location > range {
                    break;
                }
            }
            let Some(name) = meta.location.filename() else {
                continue;
            };
            if name.starts_with(prefix) {
                names.push(name.to_string());
                if self.ordered_listing && names.len() == limit {
                    break;
                }
            }
        }
        Ok(page_names(names, start_after, limit))
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.store, self.root)
    }
}

struct BufferedObjectWriter {
    store: Arc<dyn ObjectStore>,
    path: Path,
    name: String,
    buf: BytesMut,
    crc: Crc32cAccumulator,
}

#[async_trait]
impl ObjectWriter for BufferedObjectWriter {
    async fn write_checksummed(&mut self, bytes: &[u8], crc32c: u32) -> Result<()> {
        self.buf.extend_from_slice(bytes);
        self.crc.update_checksummed(crc32c, bytes.len() as u64);
        Ok(())
    }

    fn checksum(&self) -> u32 {
        self.crc.value()
    }

    fn len(&self) -> u64 {
        self.crc.len()
    }

    async fn commit_if_absent(self: Box<Self>) -> Result<CommitReceipt> {
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        let size = self.crc.len();
        self.store
            .put_opts(&self.path, self.buf.freeze(), opts)
            .await
            .map_err(|e| map_err(&self.name, e))?;
        debug!(name = %self.name, size, "committed object");
        Ok(CommitReceipt {
            name: self.name,
            size,
            crc32c: self.crc.value(),
        })
    }
}
