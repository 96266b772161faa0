use crate::{KvStore, StoreResult, WriteBatch};
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

#[derive(Clone, Default)]
pub struct MemKvStore {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl std::fmt::Debug for MemKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemKvStore")
            .field("entries", &self.read().len())
            .finish()
    }
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry, for comparing whole-store states in tests and tools.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.read().clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KvStore for MemKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.read().get(key).cloned())
    }

    fn range(&self, start: &str, end: Option<&str>) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Ok(range_of(&self.read(), start, end))
    }

    fn commit(&self, batch: &WriteBatch) -> StoreResult<()> {
        batch.apply_to(&mut self.write());
        Ok(())
    }
}

pub(crate) fn range_of(
    map: &BTreeMap<String, Vec<u8>>,
    start: &str,
    end: Option<&str>,
) -> Vec<(String, Vec<u8>)> {
    let upper = match end {
        Some(end) if end <= start => return Vec::new(),
        Some(end) => Bound::Excluded(end),
        None => Bound::Unbounded,
    };
    map.range::<str, _>((Bound::Included(start), upper))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
