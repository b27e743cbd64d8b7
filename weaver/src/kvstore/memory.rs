use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use crate::error::CResult;

use super::KvBackend;

/// In-memory key-value backend over a BTreeMap. Cloning shares the map, so
/// every worker stub of one process sees the same store; per-key operations
/// are atomic under the map mutex.
#[derive(Clone, Default)]
pub struct Memory {
    data: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl Memory {
    pub fn new() -> Self {
        Memory::default()
    }
}

impl std::fmt::Display for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "memory")
    }
}

fn prefix_end(prefix: &[u8]) -> Bound<Vec<u8>> {
    match prefix.iter().rposition(|b| *b != 0xff) {
        Some(i) => Bound::Excluded(
            prefix.iter().take(i).copied().chain(std::iter::once(prefix[i] + 1)).collect(),
        ),
        None => Bound::Unbounded,
    }
}

impl KvBackend for Memory {
    fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        Ok(self.data.lock()?.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.data.lock()?.insert(key.to_vec(), value);
        Ok(())
    }

    fn put_if_absent(&self, key: &[u8], value: Vec<u8>) -> CResult<bool> {
        let mut data = self.data.lock()?;
        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(key.to_vec(), value);
        Ok(true)
    }

    fn delete(&self, key: &[u8]) -> CResult<()> {
        self.data.lock()?.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.lock()?;
        let range = (Bound::Included(prefix.to_vec()), prefix_end(prefix));
        Ok(data.range(range).map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn multi_put(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> CResult<()> {
        let mut data = self.data.lock()?;
        for (k, v) in entries {
            data.insert(k, v);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn point_ops() -> CResult<()> {
        let s = Memory::new();
        assert_eq!(s.get(b"a")?, None);
        s.put(b"a", vec![1])?;
        assert_eq!(s.get(b"a")?, Some(vec![1]));
        s.put(b"a", vec![2])?;
        assert_eq!(s.get(b"a")?, Some(vec![2]));
        s.delete(b"a")?;
        assert_eq!(s.get(b"a")?, None);
        // deletes are idempotent
        s.delete(b"a")?;
        Ok(())
    }

    #[test]
    fn put_if_absent_is_first_writer_wins() -> CResult<()> {
        let s = Memory::new();
        assert!(s.put_if_absent(b"k", vec![1])?);
        assert!(!s.put_if_absent(b"k", vec![2])?);
        assert_eq!(s.get(b"k")?, Some(vec![1]));
        Ok(())
    }

    #[test]
    fn scan_prefix_handles_0xff() -> CResult<()> {
        let s = Memory::new();
        s.put(b"b", vec![2])?;
        s.put(b"ba", vec![3])?;
        s.put(b"b\xff", vec![4])?;
        s.put(b"c", vec![5])?;
        s.put(b"\xff\xff", vec![6])?;

        let hits = s.scan_prefix(b"b")?;
        assert_eq!(
            hits.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![b"b".to_vec(), b"ba".to_vec(), b"b\xff".to_vec()],
        );
        assert_eq!(s.scan_prefix(b"\xff")?.len(), 1);
        Ok(())
    }

    #[test]
    fn clones_share_the_map() -> CResult<()> {
        let a = Memory::new();
        let b = a.clone();
        a.put(b"k", vec![9])?;
        assert_eq!(b.get(b"k")?, Some(vec![9]));
        Ok(())
    }
}
