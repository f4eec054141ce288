//! Optional sled-backed persistence for a namespace.
//!
//! The namespace writes through a [`sled::Batch`]: per-item records under
//! `I<id>`, the schema under `S`, the tagsmatcher under `T`, user meta
//! under `M:<key>` and the cache mode byte under `C`. Batches apply when
//! `flush` is called or once enough writes pile up.

use memdb_types::{Error, IdType, NamespaceDef, Result};

use crate::tagsmatcher::TagsMatcher;

/// Pending writes that force an implicit batch apply.
const UNFLUSHED_LIMIT: usize = 1000;

const SCHEMA_KEY: &[u8] = b"S";
const TAGS_KEY: &[u8] = b"T";
const CACHE_MODE_KEY: &[u8] = b"C";
const ITEM_PREFIX: u8 = b'I';
const META_PREFIX: &[u8] = b"M:";

fn item_key(id: IdType) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = ITEM_PREFIX;
    key[1..].copy_from_slice(&(id as u64).to_be_bytes());
    key
}

fn meta_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(META_PREFIX.len() + name.len());
    key.extend_from_slice(META_PREFIX);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Storage handle of one namespace.
pub struct NsStorage {
    db: sled::Db,
    batch: sled::Batch,
    unflushed: usize,
}

impl std::fmt::Debug for NsStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NsStorage")
            .field("unflushed", &self.unflushed)
            .finish()
    }
}

impl NsStorage {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let db = sled::open(path).map_err(Error::storage)?;
        Ok(Self {
            db,
            batch: sled::Batch::default(),
            unflushed: 0,
        })
    }

    /// Open a throwaway in-memory-backed store (tests).
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(Error::storage)?;
        Ok(Self {
            db,
            batch: sled::Batch::default(),
            unflushed: 0,
        })
    }

    pub fn put_item(&mut self, id: IdType, bytes: Vec<u8>) -> Result<()> {
        self.batch.insert(item_key(id).to_vec(), bytes);
        self.bump()
    }

    pub fn remove_item(&mut self, id: IdType) -> Result<()> {
        self.batch.remove(item_key(id).to_vec());
        self.bump()
    }

    pub fn put_schema(&mut self, def: &NamespaceDef) -> Result<()> {
        let bytes = serde_json::to_vec(def).map_err(Error::storage)?;
        self.batch.insert(SCHEMA_KEY, bytes);
        self.bump()
    }

    pub fn put_tags_matcher(&mut self, tags: &TagsMatcher) -> Result<()> {
        let bytes = serde_json::to_vec(tags).map_err(Error::storage)?;
        self.batch.insert(TAGS_KEY, bytes);
        self.bump()
    }

    pub fn put_meta(&mut self, key: &str, data: &[u8]) -> Result<()> {
        self.batch.insert(meta_key(key), data);
        self.bump()
    }

    pub fn put_cache_mode(&mut self, mode: u8) -> Result<()> {
        self.batch.insert(CACHE_MODE_KEY, &[mode][..]);
        self.bump()
    }

    fn bump(&mut self) -> Result<()> {
        self.unflushed += 1;
        if self.unflushed >= UNFLUSHED_LIMIT {
            self.flush()?;
        }
        Ok(())
    }

    /// Apply the pending batch and sync to disk.
    pub fn flush(&mut self) -> Result<()> {
        if self.unflushed == 0 {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        self.db.apply_batch(batch).map_err(Error::storage)?;
        self.db.flush().map_err(Error::storage)?;
        self.unflushed = 0;
        Ok(())
    }

    pub fn load_schema(&self) -> Result<Option<NamespaceDef>> {
        match self.db.get(SCHEMA_KEY).map_err(Error::storage)? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(Error::storage)?,
            )),
            None => Ok(None),
        }
    }

    pub fn load_tags_matcher(&self) -> Result<Option<TagsMatcher>> {
        match self.db.get(TAGS_KEY).map_err(Error::storage)? {
            Some(bytes) => {
                let mut tags: TagsMatcher =
                    serde_json::from_slice(&bytes).map_err(Error::storage)?;
                tags.rebuild();
                Ok(Some(tags))
            }
            None => Ok(None),
        }
    }

    /// All stored items as `(id, payload bytes)`.
    pub fn load_items(&self) -> Result<Vec<(IdType, Vec<u8>)>> {
        let mut items = Vec::new();
        for pair in self.db.scan_prefix([ITEM_PREFIX]) {
            let (key, value) = pair.map_err(Error::storage)?;
            if key.len() != 9 {
                return Err(Error::not_valid("malformed item key in storage"));
            }
            let mut id_bytes = [0u8; 8];
            id_bytes.copy_from_slice(&key[1..]);
            items.push((u64::from_be_bytes(id_bytes) as IdType, value.to_vec()));
        }
        Ok(items)
    }

    pub fn load_meta(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut meta = Vec::new();
        for pair in self.db.scan_prefix(META_PREFIX) {
            let (key, value) = pair.map_err(Error::storage)?;
            let name = std::str::from_utf8(&key[META_PREFIX.len()..])
                .map_err(|_| Error::not_valid("malformed meta key in storage"))?
                .to_string();
            meta.push((name, value.to_vec()));
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memdb_types::{IndexDef, IndexType, KeyValueType};

    #[test]
    fn test_item_round_trip() {
        let mut storage = NsStorage::open_temporary().unwrap();
        storage.put_item(3, vec![1, 2, 3]).unwrap();
        storage.put_item(7, vec![4, 5]).unwrap();
        storage.remove_item(3).unwrap();
        storage.flush().unwrap();

        let items = storage.load_items().unwrap();
        assert_eq!(items, vec![(7, vec![4, 5])]);
    }

    #[test]
    fn test_schema_round_trip() {
        let mut storage = NsStorage::open_temporary().unwrap();
        let def = NamespaceDef::new("users").with_index(IndexDef::new(
            "id",
            IndexType::Hash,
            KeyValueType::Int,
        ));
        storage.put_schema(&def).unwrap();
        storage.flush().unwrap();
        assert_eq!(storage.load_schema().unwrap(), Some(def));
    }

    #[test]
    fn test_meta_round_trip() {
        let mut storage = NsStorage::open_temporary().unwrap();
        storage.put_meta("owner", b"tests").unwrap();
        storage.flush().unwrap();
        let meta = storage.load_meta().unwrap();
        assert_eq!(meta, vec![("owner".to_string(), b"tests".to_vec())]);
    }

    #[test]
    fn test_unflushed_batch_not_visible() {
        let mut storage = NsStorage::open_temporary().unwrap();
        storage.put_item(1, vec![9]).unwrap();
        // Not flushed yet: the store still reads empty.
        assert!(storage.load_items().unwrap().is_empty());
        storage.flush().unwrap();
        assert_eq!(storage.load_items().unwrap().len(), 1);
    }
}
