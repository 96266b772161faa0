use crate::{KvStore, StoreError, StoreResult, WriteBatch, io_error, mem_store::range_of};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::{
    collections::BTreeMap,
    fmt,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use swingset_cbor::{Hash, from_cbor, to_canonical_cbor};

const BASE_FILE: &str = "kv.base";
const BASE_TMP_FILE: &str = "kv.base.tmp";
const LOG_FILE: &str = "kv.log";
const LEN_BYTES: usize = 4;
const SUM_BYTES: usize = 32;

/// Durable store: a base image plus an append-only log of committed batches.
///
/// Every log record is `u32 LE length | canonical CBOR record | sha256(record)` and is
/// fsynced before `commit` returns. On open, records are replayed in order. A final record
/// that runs past the end of the file never finished committing and is cut off; a
/// complete record that fails its checksum or does not decode is reported as
/// [`StoreError::Corrupt`] and the log is left as it is.
pub struct FsKvStore {
    root: PathBuf,
    inner: RwLock<FsState>,
}

struct FsState {
    entries: BTreeMap<String, Vec<u8>>,
    log: File,
    next_seq: u64,
    log_records: u64,
    poisoned: bool,
}

#[derive(Serialize, Deserialize)]
struct LogRecord {
    seq: u64,
    batch: WriteBatch,
}

#[derive(Serialize, Deserialize)]
struct BaseImage {
    /// Sequence number of the last batch folded into this image.
    last_seq: Option<u64>,
    entries: BTreeMap<String, ByteBuf>,
}

impl fmt::Debug for FsKvStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("FsKvStore")
            .field("root", &self.root)
            .field("entries", &state.entries.len())
            .field("log_records", &state.log_records)
            .finish()
    }
}

impl FsKvStore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| io_error(&root, e))?;

        let base_path = root.join(BASE_FILE);
        let (mut entries, base_seq) = if base_path.exists() {
            let image = read_base(&base_path)?;
            let entries = image
                .entries
                .into_iter()
                .map(|(k, v)| (k, v.into_vec()))
                .collect();
            (entries, image.last_seq)
        } else {
            (BTreeMap::new(), None)
        };

        let log_path = root.join(LOG_FILE);
        let bytes = match fs::read(&log_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(io_error(&log_path, err)),
        };
        let (records, valid_len) = scan_log(&log_path, &bytes)?;

        let mut next_seq = base_seq.map(|seq| seq + 1).unwrap_or(0);
        let mut log_records = 0;
        for record in records {
            log_records += 1;
            if base_seq.is_some_and(|base| record.seq <= base) {
                continue;
            }
            record.batch.apply_to(&mut entries);
            next_seq = record.seq + 1;
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| io_error(&log_path, e))?;
        if valid_len < bytes.len() {
            log::warn!(
                "discarding {} bytes of incomplete commit at the tail of {}",
                bytes.len() - valid_len,
                log_path.display()
            );
            log.set_len(valid_len as u64)
                .map_err(|e| io_error(&log_path, e))?;
            log.sync_all().map_err(|e| io_error(&log_path, e))?;
        }

        Ok(Self {
            root,
            inner: RwLock::new(FsState {
                entries,
                log,
                next_seq,
                log_records,
                poisoned: false,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    /// Number of records currently in the commit log (including ones already in the base).
    pub fn log_records(&self) -> u64 {
        self.read().log_records
    }

    /// Fold the log into a fresh base image and reset the log.
    ///
    /// The new base is written to a temporary file, synced, and renamed over the old one, so
    /// a crash leaves either the old base plus the full log or the new base. Log records the
    /// new base already covers are skipped on the next open.
    pub fn compact(&self) -> StoreResult<()> {
        let mut state = self.write();
        if state.poisoned {
            return Err(StoreError::Poisoned);
        }
        let image = BaseImage {
            last_seq: state.next_seq.checked_sub(1),
            entries: state
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), ByteBuf::from(v.clone())))
                .collect(),
        };
        let bytes = to_canonical_cbor(&image)?;

        let tmp_path = self.root.join(BASE_TMP_FILE);
        let base_path = self.root.join(BASE_FILE);
        {
            let mut tmp = File::create(&tmp_path).map_err(|e| io_error(&tmp_path, e))?;
            tmp.write_all(&bytes).map_err(|e| io_error(&tmp_path, e))?;
            tmp.write_all(Hash::of_bytes(&bytes).as_bytes())
                .map_err(|e| io_error(&tmp_path, e))?;
            tmp.sync_all().map_err(|e| io_error(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, &base_path).map_err(|e| io_error(&base_path, e))?;
        File::open(&self.root)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| io_error(&self.root, e))?;

        let log_path = self.log_path();
        state.log.set_len(0).map_err(|e| io_error(&log_path, e))?;
        state.log.sync_all().map_err(|e| io_error(&log_path, e))?;
        state.log_records = 0;
        log::info!(
            "compacted {} into base image ({} keys)",
            self.root.display(),
            state.entries.len()
        );
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, FsState> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, FsState> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KvStore for FsKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.read().entries.get(key).cloned())
    }

    fn range(&self, start: &str, end: Option<&str>) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Ok(range_of(&self.read().entries, start, end))
    }

    fn commit(&self, batch: &WriteBatch) -> StoreResult<()> {
        let mut state = self.write();
        if state.poisoned {
            return Err(StoreError::Poisoned);
        }
        let record = LogRecord {
            seq: state.next_seq,
            batch: batch.clone(),
        };
        let body = to_canonical_cbor(&record)?;
        let len = u32::try_from(body.len()).map_err(|_| StoreError::Corrupt {
            path: self.log_path(),
            reason: "commit larger than 4GiB".into(),
        })?;
        let mut frame = Vec::with_capacity(LEN_BYTES + body.len() + SUM_BYTES);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(Hash::of_bytes(&body).as_bytes());

        let written = state
            .log
            .write_all(&frame)
            .and_then(|_| state.log.sync_all());
        if let Err(err) = written {
            // The log tail is now unknown; only a reopen can tell what landed.
            state.poisoned = true;
            return Err(io_error(self.log_path(), err));
        }

        batch.apply_to(&mut state.entries);
        state.next_seq += 1;
        state.log_records += 1;
        Ok(())
    }
}

fn read_base(path: &Path) -> StoreResult<BaseImage> {
    let bytes = fs::read(path).map_err(|e| io_error(path, e))?;
    let corrupt = |reason: &str| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if bytes.len() < SUM_BYTES {
        return Err(corrupt("base image shorter than its checksum"));
    }
    let (body, sum) = bytes.split_at(bytes.len() - SUM_BYTES);
    if Hash::of_bytes(body).as_bytes().as_slice() != sum {
        return Err(corrupt("base image checksum mismatch"));
    }
    Ok(from_cbor(body)?)
}

/// Parse the checksummed records of a log. Returns the records and the length of the
/// prefix they cover; anything after it is a torn final record.
fn scan_log(path: &Path, bytes: &[u8]) -> StoreResult<(Vec<LogRecord>, usize)> {
    let corrupt = |offset: usize, reason: &str| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("record at offset {offset}: {reason}"),
    };
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let rest = &bytes[offset..];
        // Preallocated space that a crash left zero-filled.
        if rest.iter().all(|b| *b == 0) {
            break;
        }
        let Some(header) = rest.get(..LEN_BYTES) else {
            break;
        };
        let mut len_buf = [0u8; LEN_BYTES];
        len_buf.copy_from_slice(header);
        let len = u32::from_le_bytes(len_buf) as usize;
        let sum_start = LEN_BYTES + len;
        let end = sum_start + SUM_BYTES;
        let (Some(body), Some(sum)) = (rest.get(LEN_BYTES..sum_start), rest.get(sum_start..end))
        else {
            break;
        };
        if Hash::of_bytes(body).as_bytes().as_slice() != sum {
            return Err(corrupt(offset, "checksum mismatch"));
        }
        let record = from_cbor::<LogRecord>(body)
            .map_err(|err| corrupt(offset, &format!("undecodable: {err}")))?;
        if let Some(prev) = records.last().map(|r: &LogRecord| r.seq)
            && record.seq != prev + 1
        {
            return Err(corrupt(
                offset,
                &format!("sequence {} follows {prev}", record.seq),
            ));
        }
        records.push(record);
        offset += end;
    }
    Ok((records, offset))
}
