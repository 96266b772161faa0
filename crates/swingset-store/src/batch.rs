use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// A set of key writes and deletes applied as one unit. Later operations on the same key
/// replace earlier ones, so a batch never carries two ops for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: BTreeMap<String, Option<ByteBuf>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.ops.insert(key.into(), Some(ByteBuf::from(value)));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.insert(key.into(), None);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operations in key order; `None` marks a delete.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&[u8]>)> {
        self.ops
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_ref().map(|buf| buf.as_slice())))
    }

    pub(crate) fn apply_to(&self, map: &mut BTreeMap<String, Vec<u8>>) {
        for (key, value) in self.iter() {
            match value {
                Some(bytes) => {
                    map.insert(key.to_string(), bytes.to_vec());
                }
                None => {
                    map.remove(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_to_a_key_wins() {
        let mut batch = WriteBatch::new();
        batch.set("a", b"1".to_vec());
        batch.delete("a");
        batch.set("b", b"2".to_vec());
        batch.set("b", b"3".to_vec());
        assert_eq!(batch.len(), 2);

        let mut map = BTreeMap::new();
        map.insert("a".to_string(), b"old".to_vec());
        batch.apply_to(&mut map);
        assert!(!map.contains_key("a"));
        assert_eq!(map.get("b").map(Vec::as_slice), Some(b"3".as_slice()));
    }
}
