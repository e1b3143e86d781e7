//! Append-only, length-prefixed event log used to replay updates to a late
//! joining peer without needing every peer to be online at the same time.
//!
//! On-disk format is a sequence of `[u32 big-endian length][bytes]` records.
//! A crash mid-write can leave a truncated final record; loading tolerates
//! that by stopping at the first record whose declared length runs past the
//! end of the file, rather than treating it as corruption.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::error::{PlutusError, PlutusResult};

struct Inner {
    file: File,
    entries: Vec<Vec<u8>>,
    byte_len: u64,
}

/// Retention limits applied after every append.
#[derive(Debug, Clone, Copy, Default)]
pub struct Retention {
    /// Drop the oldest entries once the log holds more than this many.
    pub max_entries: Option<usize>,
    /// Drop the oldest entries once the on-disk size exceeds this many bytes.
    pub max_bytes: Option<u64>,
}

/// A file-backed, append-only log of opaque update records.
pub struct EventLog {
    path: PathBuf,
    retention: Retention,
    inner: Mutex<Inner>,
}

fn read_all_records(file: &mut File) -> PlutusResult<Vec<Vec<u8>>> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset + 4 <= buf.len() {
        let len = u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        let start = offset + 4;
        if start + len > buf.len() {
            warn!(
                declared_len = len,
                available = buf.len() - start,
                "truncated trailing event log record, stopping load here"
            );
            break;
        }
        entries.push(buf[start..start + len].to_vec());
        offset = start + len;
    }
    Ok(entries)
}

fn record_bytes(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        out.extend_from_slice(&(entry.len() as u32).to_be_bytes());
        out.extend_from_slice(entry);
    }
    out
}

impl EventLog {
    /// Open (creating if absent) the log file at `path`, loading any existing
    /// records and tolerating a truncated tail left by a prior crash.
    pub fn open(path: impl AsRef<Path>, retention: Retention) -> PlutusResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let entries = read_all_records(&mut file)?;
        let byte_len = record_bytes(&entries).len() as u64;

        // Truncate away any garbage trailing bytes that didn't form a full record.
        file.set_len(byte_len)?;
        file.seek(SeekFrom::End(0))?;

        Ok(EventLog {
            path,
            retention,
            inner: Mutex::new(Inner {
                file,
                entries,
                byte_len,
            }),
        })
    }

    /// Number of records currently held (after retention has been applied).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Whether the log holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch the record at `index`, if any.
    pub fn get(&self, index: usize) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().entries.get(index).cloned()
    }

    /// Return every record currently held, oldest first.
    pub fn replay(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().entries.clone()
    }

    /// Append a record, then enforce retention.
    ///
    /// If retention removed anything, the whole file is rewritten; otherwise
    /// the record is appended in place, which is the common, cheap path.
    pub fn append(&self, entry: &[u8]) -> PlutusResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut framed = Vec::with_capacity(4 + entry.len());
        framed.extend_from_slice(&(entry.len() as u32).to_be_bytes());
        framed.extend_from_slice(entry);

        inner.file.seek(SeekFrom::End(0))?;
        inner.file.write_all(&framed)?;
        inner.entries.push(entry.to_vec());
        inner.byte_len += framed.len() as u64;

        if self.retention_exceeded(&inner) {
            self.rewrite_with_retention(&mut inner)?;
        }

        Ok(())
    }

    /// Drop every in-memory entry and rewrite the backing file as empty.
    ///
    /// Used once a replica's full state has been exported as a snapshot,
    /// making every prior incremental update record redundant. The caller is
    /// responsible for persisting that snapshot elsewhere; the log itself
    /// only clears. Logs a warning if handed an empty snapshot, since that
    /// almost always indicates a caller bug.
    pub fn compact(&self, snapshot: &[u8]) -> PlutusResult<()> {
        if snapshot.is_empty() {
            warn!("compacting event log with an empty snapshot");
        }
        let mut inner = self.inner.lock().unwrap();
        inner.entries = Vec::new();
        self.rewrite_file(&mut inner)
    }

    fn retention_exceeded(&self, inner: &Inner) -> bool {
        if let Some(max_entries) = self.retention.max_entries {
            if inner.entries.len() > max_entries {
                return true;
            }
        }
        if let Some(max_bytes) = self.retention.max_bytes {
            if inner.byte_len > max_bytes {
                return true;
            }
        }
        false
    }

    fn rewrite_with_retention(&self, inner: &mut Inner) -> PlutusResult<()> {
        if let Some(max_entries) = self.retention.max_entries {
            if inner.entries.len() > max_entries {
                let drop = inner.entries.len() - max_entries;
                inner.entries.drain(0..drop);
            }
        }
        if let Some(max_bytes) = self.retention.max_bytes {
            while inner.byte_len_of_entries() > max_bytes && inner.entries.len() > 1 {
                inner.entries.remove(0);
            }
        }
        self.rewrite_file(inner)
    }

    fn rewrite_file(&self, inner: &mut Inner) -> PlutusResult<()> {
        let bytes = record_bytes(&inner.entries);
        inner.file.set_len(0)?;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&bytes)?;
        inner.byte_len = bytes.len() as u64;
        Ok(())
    }

    /// The path this log is backed by.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Inner {
    fn byte_len_of_entries(&self) -> u64 {
        record_bytes(&self.entries).len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &tempfile::TempDir, retention: Retention) -> EventLog {
        EventLog::open(dir.path().join("events.log"), retention).unwrap()
    }

    #[test]
    fn append_and_replay_round_trips() {
        let dir = tempdir().unwrap();
        let log = open(&dir, Retention::default());
        log.append(b"one").unwrap();
        log.append(b"two").unwrap();
        assert_eq!(log.replay(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn reopen_reloads_prior_records() {
        let dir = tempdir().unwrap();
        {
            let log = open(&dir, Retention::default());
            log.append(b"persisted").unwrap();
        }
        let log = open(&dir, Retention::default());
        assert_eq!(log.replay(), vec![b"persisted".to_vec()]);
    }

    #[test]
    fn tolerates_truncated_trailing_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");
        {
            let log = EventLog::open(&path, Retention::default()).unwrap();
            log.append(b"whole").unwrap();
        }
        // Simulate a crash mid-write: append a length prefix with no body.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_be_bytes()).unwrap();
        }
        let log = EventLog::open(&path, Retention::default()).unwrap();
        assert_eq!(log.replay(), vec![b"whole".to_vec()]);
    }

    #[test]
    fn enforces_max_entries_retention() {
        let dir = tempdir().unwrap();
        let log = open(
            &dir,
            Retention {
                max_entries: Some(2),
                max_bytes: None,
            },
        );
        log.append(b"a").unwrap();
        log.append(b"b").unwrap();
        log.append(b"c").unwrap();
        assert_eq!(log.replay(), vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn enforces_max_bytes_retention() {
        let dir = tempdir().unwrap();
        let log = open(
            &dir,
            Retention {
                max_entries: None,
                max_bytes: Some(10),
            },
        );
        log.append(b"aaaaa").unwrap();
        log.append(b"bbbbb").unwrap();
        log.append(b"ccccc").unwrap();
        let replayed = log.replay();
        assert!(replayed.len() <= 2);
        assert_eq!(*replayed.last().unwrap(), b"ccccc".to_vec());
    }

    #[test]
    fn compact_clears_the_log_entirely() {
        let dir = tempdir().unwrap();
        let log = open(&dir, Retention::default());
        log.append(b"a").unwrap();
        log.append(b"b").unwrap();
        log.compact(b"snapshot").unwrap();
        assert_eq!(log.replay(), Vec::<Vec<u8>>::new());

        let reopened = EventLog::open(log.path(), Retention::default()).unwrap();
        assert_eq!(reopened.replay(), Vec::<Vec<u8>>::new());
    }
}
