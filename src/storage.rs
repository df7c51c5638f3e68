// The key/value sector store behind the FAT12 engine (the "persisted
// storage interface"). `SectorStore` is the seam `Fat12`'s sector cache
// reads/writes through; `MemorySectorStore` backs tests and short-lived
// sessions, `JsonSectorStore` is the text-only backing store a host can
// serialise to disk between runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

pub const SECTOR_SIZE: usize = 512;

pub trait SectorStore {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&mut self, key: &str, bytes: &[u8]);
    fn delete(&mut self, key: &str);
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;

    /// Flushes to the store's real backing medium, if it has one beyond
    /// the in-memory map. A no-op for stores with no such medium.
    fn persist(&self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySectorStore {
    sectors: BTreeMap<String, Vec<u8>>,
}

impl MemorySectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SectorStore for MemorySectorStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.sectors.get(key).cloned()
    }

    fn put(&mut self, key: &str, bytes: &[u8]) {
        self.sectors.insert(key.to_string(), bytes.to_vec());
    }

    fn delete(&mut self, key: &str) {
        self.sectors.remove(key);
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.sectors.keys().filter(|k| k.starts_with(prefix)).cloned().collect()
    }
}

/// On-disk representation: base-64 payloads keyed by sector-index string, so
/// the whole store round-trips through a single JSON document.
#[derive(Serialize, Deserialize, Default)]
struct JsonImage {
    sectors: BTreeMap<String, String>,
}

/// A `SectorStore` backed by a single JSON file, loaded fully into memory and
/// rewritten wholesale on `persist`. Individual `get`/`put` calls only touch
/// the in-memory map; nothing hits disk until `persist` is called.
pub struct JsonSectorStore {
    path: PathBuf,
    sectors: BTreeMap<String, Vec<u8>>,
}

impl JsonSectorStore {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let sectors = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let image: JsonImage = serde_json::from_str(&contents).unwrap_or_default();
                image
                    .sectors
                    .into_iter()
                    .filter_map(|(k, v)| BASE64.decode(v).ok().map(|bytes| (k, bytes)))
                    .collect()
            }
            Err(_) => BTreeMap::new(),
        };
        Ok(JsonSectorStore { path, sectors })
    }

    pub fn persist(&self) -> std::io::Result<()> {
        let image = JsonImage {
            sectors: self.sectors.iter().map(|(k, v)| (k.clone(), BASE64.encode(v))).collect(),
        };
        let contents = serde_json::to_string(&image)?;
        std::fs::write(&self.path, contents)
    }
}

impl SectorStore for JsonSectorStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.sectors.get(key).cloned()
    }

    fn put(&mut self, key: &str, bytes: &[u8]) {
        self.sectors.insert(key.to_string(), bytes.to_vec());
    }

    fn delete(&mut self, key: &str) {
        self.sectors.remove(key);
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.sectors.keys().filter(|k| k.starts_with(prefix)).cloned().collect()
    }

    fn persist(&self) -> std::io::Result<()> {
        JsonSectorStore::persist(self)
    }
}

pub fn sector_key(index: u32) -> String {
    format!("sector:{index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips() {
        let mut store = MemorySectorStore::new();
        store.put(&sector_key(5), &[1, 2, 3]);
        assert_eq!(store.get(&sector_key(5)), Some(vec![1, 2, 3]));
        assert_eq!(store.get(&sector_key(6)), None);
    }

    #[test]
    fn delete_removes_the_key() {
        let mut store = MemorySectorStore::new();
        store.put(&sector_key(0), &[0xAB]);
        store.delete(&sector_key(0));
        assert_eq!(store.get(&sector_key(0)), None);
    }

    #[test]
    fn keys_with_prefix_filters_correctly() {
        let mut store = MemorySectorStore::new();
        store.put(&sector_key(1), &[0]);
        store.put(&sector_key(2), &[0]);
        store.put("other:1", &[0]);
        let mut keys = store.keys_with_prefix("sector:");
        keys.sort();
        assert_eq!(keys, vec![sector_key(1), sector_key(2)]);
    }

    #[test]
    fn json_store_persists_and_reloads_base64_encoded_sectors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.json");
        {
            let mut store = JsonSectorStore::open(&path).unwrap();
            store.put(&sector_key(0), &[0xEB, 0x3C, 0x90]);
            store.persist().unwrap();
        }
        let reopened = JsonSectorStore::open(&path).unwrap();
        assert_eq!(reopened.get(&sector_key(0)), Some(vec![0xEB, 0x3C, 0x90]));
    }

    #[test]
    fn opening_a_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let store = JsonSectorStore::open(&path).unwrap();
        assert_eq!(store.get(&sector_key(0)), None);
    }
}
