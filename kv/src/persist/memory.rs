//! In-memory `Store`: a `BTreeMap` with no durability at all, useful for
//! tests and for nodes that are happy to lose their data on restart.
//! Adapted from the plain `BTreeMap` engine.

use std::collections::BTreeMap;

use crate::error::CResult;
use crate::persist::Store;

#[derive(Default)]
pub struct MemoryStore {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl Store for MemoryStore {
    fn load(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.data.insert(key.to_vec(), value);
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> CResult<()> {
        self.data.remove(key);
        Ok(())
    }

    fn load_all(&mut self) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn flush(&mut self) -> CResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_then_load_round_trips() {
        let mut s = MemoryStore::new();
        s.put(b"a", vec![1, 2]).unwrap();
        assert_eq!(s.load(b"a").unwrap(), Some(vec![1, 2]));
        s.remove(b"a").unwrap();
        assert_eq!(s.load(b"a").unwrap(), None);
    }

    #[test]
    fn load_all_returns_every_live_pair() {
        let mut s = MemoryStore::new();
        s.put(b"a", vec![1]).unwrap();
        s.put(b"b", vec![2]).unwrap();
        s.remove(b"a").unwrap();
        assert_eq!(s.load_all().unwrap(), vec![(b"b".to_vec(), vec![2])]);
    }
}
