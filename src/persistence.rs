//! Snapshot Persistence
//!
//! The whole keyspace is written to one binary file, replaced atomically on
//! every save. All integers are little-endian.
//!
//! ```text
//! header:  "SNAPKV01" | version: u16 | record count: u32
//! record:  tag: u8 | key | payload | expiry flag: u8 | [deadline: u64]
//!
//!   tag 'K' string  payload = value
//!   tag 'L' list    payload = count: u32, element * count (head first)
//!   tag 'H' hash    payload = count: u32, (field, value) * count
//!
//!   key, value, element, field: len: u32 | bytes
//!   deadline: absolute Unix time in milliseconds
//! ```
//!
//! Deadlines live on the monotonic clock while the server runs, so they are
//! translated to wall-clock time on save and back on load. A record whose
//! deadline passed while the server was down is dropped on load.

use crate::storage::{SnapshotRecord, StorageEngine, Value, MAX_TTL};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

/// Marker at the start of every snapshot file.
pub const SNAPSHOT_MAGIC: &[u8; 8] = b"SNAPKV01";

pub const SNAPSHOT_VERSION: u16 = 1;

const TAG_STRING: u8 = b'K';
const TAG_LIST: u8 = b'L';
const TAG_HASH: u8 = b'H';

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file exists but is not a snapshot this build can read
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    /// The keyspace holds something the format cannot represent
    #[error("cannot encode snapshot: {0}")]
    Encode(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// What a successful save wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpSummary {
    pub keys: usize,
    pub bytes: usize,
}

/// What a load found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No file at the snapshot path; the store was left untouched
    NoSnapshot,

    Loaded {
        keys: usize,
        /// Records skipped because their deadline had passed
        expired: usize,
    },
}

/// Saves and restores the store at a fixed path.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    path: PathBuf,
}

impl SnapshotManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<path>.tmp`, the file a save writes before renaming it into place.
    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn io_error(&self, path: &Path, source: io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Writes every live key to the snapshot file.
    ///
    /// The keyspace is captured under one lock acquisition; encoding and
    /// file I/O happen after the lock is released. The previous snapshot is
    /// only replaced once the new one has been fully written and synced.
    pub fn dump(&self, engine: &StorageEngine) -> PersistenceResult<DumpSummary> {
        let records = engine.export_snapshot();
        let payload = encode_snapshot(&records, Clock::now())?;

        let temp = self.temp_path();
        let write = || -> io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(&payload)?;
            file.sync_all()
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&temp);
            return Err(self.io_error(&temp, e));
        }

        fs::rename(&temp, &self.path).map_err(|e| self.io_error(&self.path, e))?;

        let summary = DumpSummary {
            keys: records.len(),
            bytes: payload.len(),
        };
        info!(
            path = %self.path.display(),
            keys = summary.keys,
            bytes = summary.bytes,
            "Snapshot saved"
        );
        Ok(summary)
    }

    /// Replaces the store's contents with the snapshot file's.
    ///
    /// The file is decoded completely before the store is touched, so a
    /// corrupt file leaves the current contents in place.
    pub fn load(&self, engine: &StorageEngine) -> PersistenceResult<LoadOutcome> {
        let payload = match fs::read(&self.path) {
            Ok(payload) => Bytes::from(payload),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot to load");
                return Ok(LoadOutcome::NoSnapshot);
            }
            Err(e) => return Err(self.io_error(&self.path, e)),
        };

        let decoded = decode_snapshot(payload, Clock::now())?;
        let keys = decoded.records.len();
        engine.import_snapshot(decoded.records);

        info!(
            path = %self.path.display(),
            keys,
            expired = decoded.expired,
            "Snapshot loaded"
        );
        Ok(LoadOutcome::Loaded {
            keys,
            expired: decoded.expired,
        })
    }
}

/// A matched reading of both clocks, used to translate deadlines.
#[derive(Debug, Clone, Copy)]
struct Clock {
    instant: Instant,
    system: SystemTime,
}

impl Clock {
    fn now() -> Self {
        Self {
            instant: Instant::now(),
            system: SystemTime::now(),
        }
    }

    /// Saturates at `u64::MAX` instead of wrapping.
    fn to_unix_millis(self, deadline: Instant) -> u64 {
        let remaining = deadline.saturating_duration_since(self.instant);
        let Some(wall) = self.system.checked_add(remaining) else {
            return u64::MAX;
        };
        wall.duration_since(UNIX_EPOCH).map_or(0, |since| {
            u64::try_from(since.as_millis()).unwrap_or(u64::MAX)
        })
    }

    /// `None` if the deadline is already due.
    ///
    /// Deadlines further out than [`MAX_TTL`] are pulled in to it.
    fn to_instant(self, unix_millis: u64) -> Option<Instant> {
        let remaining = match UNIX_EPOCH.checked_add(Duration::from_millis(unix_millis)) {
            Some(wall) => wall.duration_since(self.system).unwrap_or(Duration::ZERO),
            None => MAX_TTL,
        };
        if remaining.is_zero() {
            return None;
        }
        self.instant.checked_add(remaining.min(MAX_TTL))
    }
}

fn encode_snapshot(records: &[SnapshotRecord], clock: Clock) -> PersistenceResult<Vec<u8>> {
    let mut output = Vec::new();
    output.extend_from_slice(SNAPSHOT_MAGIC);
    output.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    write_len(&mut output, records.len(), "record count")?;

    for record in records {
        match &record.value {
            Value::String(value) => {
                output.push(TAG_STRING);
                write_bytes(&mut output, &record.key)?;
                write_bytes(&mut output, value)?;
            }
            Value::List(list) => {
                output.push(TAG_LIST);
                write_bytes(&mut output, &record.key)?;
                write_len(&mut output, list.len(), "list length")?;
                for element in list {
                    write_bytes(&mut output, element)?;
                }
            }
            Value::Hash(hash) => {
                output.push(TAG_HASH);
                write_bytes(&mut output, &record.key)?;
                write_len(&mut output, hash.len(), "hash length")?;
                for (field, value) in hash {
                    write_bytes(&mut output, field)?;
                    write_bytes(&mut output, value)?;
                }
            }
        }

        match record.expires_at {
            Some(deadline) => {
                output.push(1);
                output.extend_from_slice(&clock.to_unix_millis(deadline).to_le_bytes());
            }
            None => output.push(0),
        }
    }

    Ok(output)
}

fn write_len(output: &mut Vec<u8>, len: usize, what: &str) -> PersistenceResult<()> {
    let len = u32::try_from(len)
        .map_err(|_| PersistenceError::Encode(format!("{what} {len} exceeds u32::MAX")))?;
    output.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn write_bytes(output: &mut Vec<u8>, bytes: &[u8]) -> PersistenceResult<()> {
    write_len(output, bytes.len(), "string length")?;
    output.extend_from_slice(bytes);
    Ok(())
}

#[derive(Debug)]
struct DecodedSnapshot {
    records: Vec<SnapshotRecord>,
    expired: usize,
}

fn decode_snapshot(payload: Bytes, clock: Clock) -> PersistenceResult<DecodedSnapshot> {
    let mut cursor = Cursor::new(payload);

    if cursor.read_slice(SNAPSHOT_MAGIC.len())? != SNAPSHOT_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = cursor.read_u16()?;
    if version != SNAPSHOT_VERSION {
        return Err(corrupt(format!("unsupported version {version}")));
    }

    let count = cursor.read_len()?;
    let mut records = Vec::with_capacity(count.min(1024));
    let mut expired = 0;

    for index in 0..count {
        let tag = cursor.read_u8()?;
        let key = cursor.read_bytes()?;
        let value = match tag {
            TAG_STRING => Value::String(cursor.read_bytes()?),
            TAG_LIST => {
                let len = cursor.read_len()?;
                let mut list = VecDeque::with_capacity(len.min(1024));
                for _ in 0..len {
                    list.push_back(cursor.read_bytes()?);
                }
                Value::List(list)
            }
            TAG_HASH => {
                let len = cursor.read_len()?;
                let mut hash = HashMap::with_capacity(len.min(1024));
                for _ in 0..len {
                    let field = cursor.read_bytes()?;
                    hash.insert(field, cursor.read_bytes()?);
                }
                Value::Hash(hash)
            }
            other => {
                return Err(corrupt(format!(
                    "unknown type tag {other:#04x} in record {index}"
                )))
            }
        };

        let expires_at = match cursor.read_u8()? {
            0 => None,
            1 => match clock.to_instant(cursor.read_u64()?) {
                Some(deadline) => Some(deadline),
                None => {
                    expired += 1;
                    continue;
                }
            },
            flag => {
                return Err(corrupt(format!(
                    "invalid expiry flag {flag} in record {index}"
                )))
            }
        };

        records.push(SnapshotRecord {
            key,
            value,
            expires_at,
        });
    }

    cursor.ensure_fully_consumed()?;
    Ok(DecodedSnapshot { records, expired })
}

fn corrupt(message: impl Into<String>) -> PersistenceError {
    PersistenceError::Corrupt(message.into())
}

/// Reads fields off the front of a snapshot, tracking the offset for
/// error messages. Strings are zero-copy slices of the file buffer.
#[derive(Debug)]
struct Cursor {
    payload: Bytes,
    offset: usize,
}

impl Cursor {
    fn new(payload: Bytes) -> Self {
        Self { payload, offset: 0 }
    }

    fn advance(&mut self, len: usize) -> PersistenceResult<std::ops::Range<usize>> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.payload.len())
            .ok_or_else(|| {
                corrupt(format!(
                    "unexpected end of file at offset {} reading {len} bytes",
                    self.offset
                ))
            })?;
        let range = self.offset..end;
        self.offset = end;
        Ok(range)
    }

    fn read_slice(&mut self, len: usize) -> PersistenceResult<&[u8]> {
        let range = self.advance(len)?;
        Ok(&self.payload[range])
    }

    fn read_array<const N: usize>(&mut self) -> PersistenceResult<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.read_slice(N)?);
        Ok(array)
    }

    fn read_u8(&mut self) -> PersistenceResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_u16(&mut self) -> PersistenceResult<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    fn read_u32(&mut self) -> PersistenceResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> PersistenceResult<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn read_len(&mut self) -> PersistenceResult<usize> {
        usize::try_from(self.read_u32()?).map_err(|_| corrupt("length exceeds platform limits"))
    }

    fn read_bytes(&mut self) -> PersistenceResult<Bytes> {
        let len = self.read_len()?;
        let range = self.advance(len)?;
        Ok(self.payload.slice(range))
    }

    fn ensure_fully_consumed(&self) -> PersistenceResult<()> {
        if self.offset == self.payload.len() {
            Ok(())
        } else {
            Err(corrupt(format!(
                "{} trailing bytes after last record",
                self.payload.len() - self.offset
            )))
        }
    }
}
