//! Ordered key/value storage with atomic multi-key commits, plus in-memory and filesystem backends.

mod batch;
mod fs_store;
mod mem_store;

pub use batch::WriteBatch;
pub use fs_store::FsKvStore;
pub use mem_store::MemKvStore;

use std::{io, path::PathBuf, sync::Arc};

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynKvStore = Arc<dyn KvStore>;

/// Ordered string-keyed store. Writes only happen through [`KvStore::commit`], which applies
/// a whole batch or nothing.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Entries with `start <= key < end` in ascending key order; `end = None` is unbounded.
    fn range(&self, start: &str, end: Option<&str>) -> StoreResult<Vec<(String, Vec<u8>)>>;

    fn commit(&self, batch: &WriteBatch) -> StoreResult<()>;

    fn has(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Every entry whose key starts with `prefix`.
    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let end = prefix_end(prefix);
        self.range(prefix, end.as_deref())
    }
}

impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn range(&self, start: &str, end: Option<&str>) -> StoreResult<Vec<(String, Vec<u8>)>> {
        (**self).range(start, end)
    }

    fn commit(&self, batch: &WriteBatch) -> StoreResult<()> {
        (**self).commit(batch)
    }
}

/// Smallest key greater than every key starting with `prefix`, if one exists.
pub fn prefix_end(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CBOR serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("corrupt store file {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("store refused write after an earlier failed commit")]
    Poisoned,
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}
