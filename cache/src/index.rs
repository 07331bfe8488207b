use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use grr_core::{CacheKey, CacheValue};

/// Process-wide associative container mapping a translated block's
/// `CacheKey` to its `CacheValue`. A zero value is never stored — absence
/// and zero are the same thing, matching the packed-union contract both
/// records make.
#[derive(Default)]
pub struct Index {
    table: HashMap<u64, u64>,
}

impl Index {
    pub fn new() -> Self {
        Index { table: HashMap::new() }
    }

    pub fn find(&self, key: CacheKey) -> Option<CacheValue> {
        self.table.get(&key.pack()).copied().map(CacheValue::unpack)
    }

    pub fn insert(&mut self, key: CacheKey, value: CacheValue) {
        debug_assert!(key.is_valid());
        debug_assert!(value.is_valid());
        self.table.insert(key.pack(), value.pack());
    }

    pub fn remove(&mut self, key: CacheKey) {
        self.table.remove(&key.pack());
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CacheKey, CacheValue)> + '_ {
        self.table
            .iter()
            .map(|(&k, &v)| (CacheKey::unpack(k), CacheValue::unpack(v)))
    }

    pub fn dump(&self) {
        for (key, value) in self.iter() {
            log::debug!("{:?} -> {:?}", key, value);
        }
    }

    /// Serializes every entry as a dense array of `(CacheKey, CacheValue)`
    /// records to `path`.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut file = File::create(path)?;
        for (&key, &value) in &self.table {
            file.write_all(&key.to_le_bytes())?;
            file.write_all(&value.to_le_bytes())?;
        }
        Ok(())
    }

    /// Repopulates the index by scanning a file written by [`save`](Self::save).
    pub fn load(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut table = HashMap::new();
        for chunk in bytes.chunks_exact(16) {
            let key = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
            let value = u64::from_le_bytes(chunk[8..16].try_into().unwrap());
            if key != 0 && value != 0 {
                table.insert(key, value);
            }
        }
        Ok(Index { table })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_find_round_trips() {
        let mut idx = Index::new();
        let key = CacheKey::new(0x1000, 1, 0xABCDEF);
        let value = CacheValue {
            block_pc32: 0x1000,
            cache_offset: 64,
            ..Default::default()
        };
        idx.insert(key, value);
        assert_eq!(idx.find(key), Some(value));
    }

    #[test]
    fn save_and_load_round_trip_through_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grr.index");

        let mut idx = Index::new();
        let key = CacheKey::new(0x2000, 2, 0x1);
        let value = CacheValue {
            block_pc32: 0x2000,
            cache_offset: 128,
            has_one_successor: true,
            ..Default::default()
        };
        idx.insert(key, value);
        idx.save(&path).unwrap();

        let reloaded = Index::load(&path).unwrap();
        assert_eq!(reloaded.find(key), Some(value));
    }
}
