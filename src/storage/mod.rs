//! Create-if-absent object storage.
//!
//! Pack objects are written exactly once. A writer buffers the object's bytes
//! and then calls [`ObjectWriter::commit_if_absent`], which durably creates
//! the object only if nothing with that name exists yet. When it does exist,
//! the commit fails with [`StoreError::AlreadyExists`] and leaves the existing
//! object untouched. Readers never observe a partially written object.
//!
//! Two drivers are provided:
//! - [`FsStore`]: temp file + fsync + hard link in a local directory
//! - [`ObjectStoreDriver`]: any `object_store` backend, using `PutMode::Create`

mod fs;
mod object;

pub use fs::FsStore;
pub use object::ObjectStoreDriver;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::codec::crc32c;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};

/// URI selecting the in-process object store.
pub const MEMORY_STORE_URI: &str = "memory://";

/// Outcome of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub name: String,
    pub size: u64,
    /// CRC-32C of the committed bytes.
    pub crc32c: u32,
}

/// Storage with atomic create-if-absent writes.
#[async_trait]
pub trait ConditionalStore: Send + Sync + 'static {
    /// Obtain a write handle for `name`. Does not touch durable state.
    ///
    /// Several handles for the same name may be open at once; at most one of
    /// them can ever commit.
    async fn open_for_create(&self, name: &str) -> Result<Box<dyn ObjectWriter>>;

    async fn exists(&self, name: &str) -> Result<bool>;

    /// Full contents of `name`, or [`StoreError::NotFound`].
    async fn read(&self, name: &str) -> Result<Bytes>;

    /// Up to `limit` names beginning with `prefix` and sorting strictly after
    /// `start_after`, in ascending order.
    async fn list_after(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// Write handle for one object.
#[async_trait]
pub trait ObjectWriter: Send {
    /// Append bytes whose CRC-32C the caller already knows.
    async fn write_checksummed(&mut self, bytes: &[u8], crc32c: u32) -> Result<()>;

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let crc = crc32c(bytes);
        self.write_checksummed(bytes, crc).await
    }

    /// CRC-32C of everything written so far.
    fn checksum(&self) -> u32;

    /// Bytes written so far.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Durably create the object unless one with this name already exists.
    async fn commit_if_absent(self: Box<Self>) -> Result<CommitReceipt>;
}

/// Build the store a [`StoreConfig`] points at.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn ConditionalStore>> {
    if config.location == MEMORY_STORE_URI {
        return Ok(Arc::new(ObjectStoreDriver::in_memory()));
    }
    Ok(Arc::new(FsStore::new(&config.location)?))
}

/// Object names are single path segments.
pub(crate) fn validate_name(name: &str) -> std::result::Result<(), StoreError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(|c| matches!(c, '/' | '\\' | '\0'));
    if bad {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Sort, apply the exclusive lower bound, and truncate.
pub(crate) fn page_names(
    mut names: Vec<String>,
    start_after: Option<&str>,
    limit: usize,
) -> Vec<String> {
    if let Some(after) = start_after {
        names.retain(|n| n.as_str() > after);
    }
    names.sort_unstable();
    names.truncate(limit);
    names
}
