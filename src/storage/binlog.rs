//! Append-only indexed binlog
//!
//! Entries live in a dedicated RocksDB instance keyed by the 8-byte
//! host-order log index. The reserved key `#BINLOG_LEN#` carries the log
//! length and is written in the same atomic batch as the entries it
//! counts, so length and content can never disagree after a crash.

use crate::common::{Error, Result};
use rocksdb::{WriteBatch, DB};
use std::path::Path;
use std::sync::Mutex;

const LOG_DB_NAME: &str = "#binlog";
const LENGTH_TAG: &[u8] = b"#BINLOG_LEN#";

/// Operation tag of a log entry. Discriminants are frozen: `Put` (1) and
/// `Lock` (3) double as the on-disk value prefix byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogOp {
    Nop = 0,
    Put = 1,
    Del = 2,
    Lock = 3,
    Unlock = 4,
    Login = 5,
    Logout = 6,
    Register = 7,
}

impl LogOp {
    pub fn from_u8(byte: u8) -> Option<LogOp> {
        match byte {
            0 => Some(LogOp::Nop),
            1 => Some(LogOp::Put),
            2 => Some(LogOp::Del),
            3 => Some(LogOp::Lock),
            4 => Some(LogOp::Unlock),
            5 => Some(LogOp::Login),
            6 => Some(LogOp::Logout),
            7 => Some(LogOp::Register),
            _ => None,
        }
    }
}

/// A single replicated log entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub op: LogOp,
    pub user: String,
    pub key: String,
    pub value: Vec<u8>,
    pub term: i64,
}

impl LogEntry {
    pub fn nop(term: i64) -> LogEntry {
        LogEntry {
            op: LogOp::Nop,
            user: String::new(),
            key: "Ping".to_string(),
            value: Vec::new(),
            term,
        }
    }

    /// Serialize into the on-disk layout:
    /// `op:u8, user_len:i32, user, key_len:i32, key, value_len:i32, value, term:i64`
    /// in host byte order, for compatibility with existing logs.
    pub fn dump(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            1 + 4 + self.user.len() + 4 + self.key.len() + 4 + self.value.len() + 8,
        );
        buf.push(self.op as u8);
        buf.extend_from_slice(&(self.user.len() as i32).to_ne_bytes());
        buf.extend_from_slice(self.user.as_bytes());
        buf.extend_from_slice(&(self.key.len() as i32).to_ne_bytes());
        buf.extend_from_slice(self.key.as_bytes());
        buf.extend_from_slice(&(self.value.len() as i32).to_ne_bytes());
        buf.extend_from_slice(&self.value);
        buf.extend_from_slice(&self.term.to_ne_bytes());
        buf
    }

    pub fn load(buf: &[u8]) -> Result<LogEntry> {
        fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
            if *pos + n > buf.len() {
                return Err(Error::Corrupted("truncated log entry".into()));
            }
            let slice = &buf[*pos..*pos + n];
            *pos += n;
            Ok(slice)
        }
        fn chunk(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
            let len = i32::from_ne_bytes(take(buf, pos, 4)?.try_into().unwrap());
            if len < 0 {
                return Err(Error::Corrupted("negative field length".into()));
            }
            Ok(take(buf, pos, len as usize)?.to_vec())
        }

        let mut pos = 0usize;
        let op_byte = take(buf, &mut pos, 1)?[0];
        let op = LogOp::from_u8(op_byte)
            .ok_or_else(|| Error::Corrupted(format!("bad op byte: {}", op_byte)))?;
        let user = String::from_utf8(chunk(buf, &mut pos)?)
            .map_err(|_| Error::Corrupted("log entry user is not utf-8".into()))?;
        let key = String::from_utf8(chunk(buf, &mut pos)?)
            .map_err(|_| Error::Corrupted("log entry key is not utf-8".into()))?;
        let value = chunk(buf, &mut pos)?;
        let term = i64::from_ne_bytes(take(buf, &mut pos, 8)?.try_into().unwrap());
        Ok(LogEntry {
            op,
            user,
            key,
            value,
            term,
        })
    }
}

fn index_key(index: i64) -> [u8; 8] {
    index.to_ne_bytes()
}

fn decode_index(key: &[u8]) -> Option<i64> {
    key.try_into().ok().map(i64::from_ne_bytes)
}

struct Cursor {
    length: i64,
    last_log_term: i64,
}

/// The durable replicated log
pub struct BinLogger {
    db: DB,
    cursor: Mutex<Cursor>,
}

impl BinLogger {
    /// Open (or create) the binlog under `data_dir`
    pub fn open(
        data_dir: impl AsRef<Path>,
        compress: bool,
        block_size_kb: usize,
        write_buffer_mb: usize,
    ) -> Result<BinLogger> {
        std::fs::create_dir_all(&data_dir)?;
        let full_name = data_dir.as_ref().join(LOG_DB_NAME);
        let opts = super::db_options(compress, block_size_kb, write_buffer_mb);
        let db = DB::open(&opts, &full_name)?;

        let mut cursor = Cursor {
            length: 0,
            last_log_term: -1,
        };
        if let Some(raw) = db.get(LENGTH_TAG)? {
            cursor.length = decode_index(&raw)
                .ok_or_else(|| Error::Corrupted("bad binlog length tag".into()))?;
            if cursor.length > 0 {
                let slot = db
                    .get(index_key(cursor.length - 1))?
                    .ok_or_else(|| Error::Corrupted("binlog length points past last slot".into()))?;
                cursor.last_log_term = LogEntry::load(&slot)?.term;
            }
        }
        tracing::info!(
            path = %full_name.display(),
            length = cursor.length,
            last_log_term = cursor.last_log_term,
            "opened binlog"
        );
        Ok(BinLogger {
            db,
            cursor: Mutex::new(cursor),
        })
    }

    /// Append one entry; returns its index
    pub fn append(&self, entry: &LogEntry) -> Result<i64> {
        let mut cursor = self.cursor.lock().unwrap();
        let index = cursor.length;
        let mut batch = WriteBatch::default();
        batch.put(index_key(index), entry.dump());
        batch.put(LENGTH_TAG, index_key(index + 1));
        self.db.write(batch)?;
        cursor.length += 1;
        cursor.last_log_term = entry.term;
        Ok(index)
    }

    /// Append a batch atomically; returns the first index (or the current
    /// length when `entries` is empty)
    pub fn append_batch(&self, entries: &[LogEntry]) -> Result<i64> {
        let mut cursor = self.cursor.lock().unwrap();
        let first = cursor.length;
        if entries.is_empty() {
            return Ok(first);
        }
        let mut batch = WriteBatch::default();
        for (offset, entry) in entries.iter().enumerate() {
            batch.put(index_key(first + offset as i64), entry.dump());
        }
        batch.put(LENGTH_TAG, index_key(first + entries.len() as i64));
        self.db.write(batch)?;
        cursor.length += entries.len() as i64;
        cursor.last_log_term = entries.last().unwrap().term;
        Ok(first)
    }

    /// Read the entry at `index`; out-of-range reads are errors
    pub fn read(&self, index: i64) -> Result<LogEntry> {
        match self.db.get(index_key(index))? {
            Some(raw) => LogEntry::load(&raw),
            None => Err(Error::SlotOutOfRange(index)),
        }
    }

    /// Drop all entries strictly after `last_keep_index` (pass -1 to clear)
    pub fn truncate(&self, last_keep_index: i64) -> Result<()> {
        let last_keep_index = last_keep_index.max(-1);
        let mut cursor = self.cursor.lock().unwrap();
        cursor.length = last_keep_index + 1;
        self.db.put(LENGTH_TAG, index_key(cursor.length))?;
        cursor.last_log_term = if cursor.length > 0 {
            match self.db.get(index_key(cursor.length - 1))? {
                Some(raw) => LogEntry::load(&raw)?.term,
                None => return Err(Error::Corrupted("truncate lost its last slot".into())),
            }
        } else {
            -1
        };
        Ok(())
    }

    /// Garbage-collect: delete every slot with index `<= up_to_index`.
    /// The length cursor is untouched; pruned slots are simply gone.
    pub fn remove_prefix(&self, up_to_index: i64) -> Result<()> {
        let mut batch = WriteBatch::default();
        for item in self.db.iterator(rocksdb::IteratorMode::Start) {
            let (key, _) = item?;
            if key.as_ref() == LENGTH_TAG {
                continue;
            }
            if let Some(index) = decode_index(&key) {
                if index <= up_to_index {
                    batch.delete(key);
                }
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn length(&self) -> i64 {
        self.cursor.lock().unwrap().length
    }

    pub fn last_log_index(&self) -> i64 {
        self.cursor.lock().unwrap().length - 1
    }

    /// Last index and its term (`(-1, -1)` for an empty log)
    pub fn last_index_and_term(&self) -> (i64, i64) {
        let cursor = self.cursor.lock().unwrap();
        (cursor.length - 1, cursor.last_log_term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(op: LogOp, key: &str, value: &str, term: i64) -> LogEntry {
        LogEntry {
            op,
            user: "u".to_string(),
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
            term,
        }
    }

    #[test]
    fn test_dump_load_round_trip() {
        let original = entry(LogOp::Lock, "/locks/a", "session-1", 7);
        let loaded = LogEntry::load(&original.dump()).unwrap();
        assert_eq!(loaded, original);

        let empty_fields = LogEntry::nop(3);
        assert_eq!(LogEntry::load(&empty_fields.dump()).unwrap(), empty_fields);
    }

    #[test]
    fn test_load_rejects_garbage() {
        assert!(LogEntry::load(&[]).is_err());
        assert!(LogEntry::load(&[42]).is_err());
        let mut truncated = entry(LogOp::Put, "k", "v", 1).dump();
        truncated.truncate(truncated.len() - 3);
        assert!(LogEntry::load(&truncated).is_err());
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let log = BinLogger::open(dir.path(), false, 32, 4).unwrap();
        assert_eq!(log.length(), 0);
        assert_eq!(log.last_index_and_term(), (-1, -1));

        let e = entry(LogOp::Put, "k", "v", 2);
        let index = log.append(&e).unwrap();
        assert_eq!(index, 0);
        assert_eq!(log.length(), 1);
        assert_eq!(log.read(0).unwrap(), e);
        assert_eq!(log.last_index_and_term(), (0, 2));
        assert!(log.read(1).is_err());
    }

    #[test]
    fn test_append_batch_and_truncate() {
        let dir = tempdir().unwrap();
        let log = BinLogger::open(dir.path(), false, 32, 4).unwrap();
        let entries: Vec<LogEntry> = (0..5)
            .map(|i| entry(LogOp::Put, &format!("k{}", i), "v", 1))
            .collect();
        let first = log.append_batch(&entries).unwrap();
        assert_eq!(first, 0);
        assert_eq!(log.length(), 5);

        log.truncate(2).unwrap();
        assert_eq!(log.length(), 3);
        assert_eq!(log.read(2).unwrap().key, "k2");
        assert!(log.read(3).is_err());

        log.truncate(-1).unwrap();
        assert_eq!(log.length(), 0);
        assert_eq!(log.last_index_and_term(), (-1, -1));
    }

    #[test]
    fn test_length_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let log = BinLogger::open(dir.path(), false, 32, 4).unwrap();
            log.append(&entry(LogOp::Put, "a", "1", 4)).unwrap();
            log.append(&entry(LogOp::Del, "a", "", 5)).unwrap();
        }
        let log = BinLogger::open(dir.path(), false, 32, 4).unwrap();
        assert_eq!(log.length(), 2);
        assert_eq!(log.last_index_and_term(), (1, 5));
        assert_eq!(log.read(1).unwrap().op, LogOp::Del);
    }

    #[test]
    fn test_remove_prefix_keeps_tail() {
        let dir = tempdir().unwrap();
        let log = BinLogger::open(dir.path(), false, 32, 4).unwrap();
        for i in 0..10 {
            log.append(&entry(LogOp::Put, &format!("k{}", i), "v", 1))
                .unwrap();
        }
        log.remove_prefix(6).unwrap();
        assert_eq!(log.length(), 10);
        for i in 0..=6 {
            assert!(log.read(i).is_err());
        }
        for i in 7..10 {
            assert_eq!(log.read(i).unwrap().key, format!("k{}", i));
        }
    }
}
