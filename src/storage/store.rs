//! Per-namespace keyed data store
//!
//! One RocksDB instance per namespace, living under
//! `<dir>/<name>@db` (the anonymous namespace is plain `@db` and is
//! always open). Values carry a one-byte op prefix: `1` for a plain put,
//! `3` for a lock; readers strip it and branch on it.

use crate::common::{Error, Result};
use crate::storage::LogOp;
use rocksdb::DB;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// The anonymous namespace shared by all clients and used for
/// state-machine bookkeeping
pub const ANONYMOUS_USER: &str = "";

/// Reserved key holding the durable apply cursor
pub const TAG_LAST_APPLIED_INDEX: &str = "#TAG_LAST_APPLIED_INDEX#";

/// Reserved key prefix for user-account records
pub const USER_RECORD_PREFIX: &str = "#USER#";

/// Keys starting with this marker are bookkeeping and invisible to scans
pub const RESERVED_KEY_MARK: char = '#';

/// Prefix a value with its op byte
pub fn encode_tagged(op: LogOp, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + value.len());
    buf.push(op as u8);
    buf.extend_from_slice(value);
    buf
}

/// Split a stored value into its op tag and payload. Only `Put` and
/// `Lock` are valid on-disk prefixes; anything else is corrupt.
pub fn decode_tagged(raw: &[u8]) -> Result<(LogOp, &[u8])> {
    let first = *raw
        .first()
        .ok_or_else(|| Error::Corrupted("stored value is empty".into()))?;
    match LogOp::from_u8(first) {
        Some(op @ (LogOp::Put | LogOp::Lock)) => Ok((op, &raw[1..])),
        _ => Err(Error::Corrupted(format!("bad value prefix byte: {}", first))),
    }
}

/// Namespaced data store
pub struct DataStore {
    data_dir: PathBuf,
    compress: bool,
    block_size_kb: usize,
    write_buffer_mb: usize,
    dbs: Mutex<HashMap<String, Arc<DB>>>,
}

impl DataStore {
    /// Open the store, creating the anonymous namespace
    pub fn open(
        data_dir: impl Into<PathBuf>,
        compress: bool,
        block_size_kb: usize,
        write_buffer_mb: usize,
    ) -> Result<DataStore> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        let store = DataStore {
            data_dir,
            compress,
            block_size_kb,
            write_buffer_mb,
            dbs: Mutex::new(HashMap::new()),
        };
        store.open_namespace(ANONYMOUS_USER)?;
        Ok(store)
    }

    fn db_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}@db", name))
    }

    fn find_db(&self, name: &str) -> Result<Arc<DB>> {
        self.dbs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownUser(name.to_string()))
    }

    /// Open a namespace; idempotent
    pub fn open_namespace(&self, name: &str) -> Result<()> {
        {
            let dbs = self.dbs.lock().unwrap();
            if dbs.contains_key(name) {
                return Ok(());
            }
        }
        let path = self.db_path(name);
        let opts = super::db_options(self.compress, self.block_size_kb, self.write_buffer_mb);
        let db = DB::open(&opts, &path)?;
        tracing::info!(namespace = %name, path = %path.display(), "opened data namespace");
        self.dbs
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(db));
        Ok(())
    }

    /// Close a namespace, dropping the handle
    pub fn close_namespace(&self, name: &str) {
        self.dbs.lock().unwrap().remove(name);
    }

    pub fn get(&self, name: &str, key: &str) -> Result<Vec<u8>> {
        let db = self.find_db(name)?;
        db.get(key.as_bytes())?
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    pub fn put(&self, name: &str, key: &str, value: &[u8]) -> Result<()> {
        let db = self.find_db(name)?;
        db.put(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn delete(&self, name: &str, key: &str) -> Result<()> {
        let db = self.find_db(name)?;
        db.delete(key.as_bytes())?;
        Ok(())
    }

    /// Key-ordered scan over `[start, end)` (`end == ""` means unbounded).
    /// The visitor returns `false` to stop early.
    pub fn scan(
        &self,
        name: &str,
        start: &str,
        end: &str,
        mut visit: impl FnMut(&str, &[u8]) -> bool,
    ) -> Result<()> {
        let db = self.find_db(name)?;
        let mode = rocksdb::IteratorMode::From(start.as_bytes(), rocksdb::Direction::Forward);
        for item in db.iterator(mode) {
            let (key, value) = item?;
            let key = std::str::from_utf8(&key)
                .map_err(|_| Error::Corrupted("stored key is not utf-8".into()))?;
            if !end.is_empty() && key >= end {
                break;
            }
            if !visit(key, &value) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_tagged_value_codec() {
        let raw = encode_tagged(LogOp::Lock, b"session-7");
        assert_eq!(raw[0], 3);
        let (op, payload) = decode_tagged(&raw).unwrap();
        assert_eq!(op, LogOp::Lock);
        assert_eq!(payload, b"session-7");

        assert!(decode_tagged(&[]).is_err());
        assert!(decode_tagged(&encode_tagged(LogOp::Del, b"x")).is_err());
    }

    #[test]
    fn test_anonymous_namespace_round_trip() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path(), false, 32, 4).unwrap();

        store.put(ANONYMOUS_USER, "/a", b"1").unwrap();
        assert_eq!(store.get(ANONYMOUS_USER, "/a").unwrap(), b"1");

        store.delete(ANONYMOUS_USER, "/a").unwrap();
        assert!(matches!(
            store.get(ANONYMOUS_USER, "/a"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_unknown_namespace() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path(), false, 32, 4).unwrap();
        assert!(matches!(
            store.get("ghost", "k"),
            Err(Error::UnknownUser(_))
        ));

        store.open_namespace("ghost").unwrap();
        store.open_namespace("ghost").unwrap(); // idempotent
        store.put("ghost", "k", b"v").unwrap();
        assert_eq!(store.get("ghost", "k").unwrap(), b"v");

        store.close_namespace("ghost");
        assert!(matches!(store.put("ghost", "k", b"v"), Err(Error::UnknownUser(_))));
    }

    #[test]
    fn test_scan_range_and_early_stop() {
        let dir = tempdir().unwrap();
        let store = DataStore::open(dir.path(), false, 32, 4).unwrap();
        for key in ["/a", "/b", "/c", "/d"] {
            store.put(ANONYMOUS_USER, key, key.as_bytes()).unwrap();
        }

        let mut seen = Vec::new();
        store
            .scan(ANONYMOUS_USER, "/b", "/d", |key, _| {
                seen.push(key.to_string());
                true
            })
            .unwrap();
        assert_eq!(seen, vec!["/b".to_string(), "/c".to_string()]);

        let mut first_only = Vec::new();
        store
            .scan(ANONYMOUS_USER, "", "", |key, _| {
                first_only.push(key.to_string());
                false
            })
            .unwrap();
        assert_eq!(first_only, vec!["/a".to_string()]);
    }
}
