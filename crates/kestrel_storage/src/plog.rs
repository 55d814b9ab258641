use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kestrel_common::api::EndAction;
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::schema::SerializedRow;
use kestrel_common::types::{Key, TxnId, TxnState};

/// Persistence log format version for compatibility checks.
pub const PLOG_FORMAT_VERSION: u32 = 1;

/// Magic bytes written at the start of each log segment.
pub const PLOG_MAGIC: &[u8; 4] = b"KPLG";

/// Segment header: magic (4) + format version (4).
pub const PLOG_SEGMENT_HEADER_SIZE: usize = 8;

const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// One durable event in a partition's append-only log. The core appends and
/// flushes before acknowledging the corresponding state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlogEntry {
    /// A write intent became durable (before it is made visible).
    WriteIntent {
        key: Key,
        txn_id: TxnId,
        schema_version: u32,
        value: SerializedRow,
        is_tombstone: bool,
    },
    /// A transaction record transitioned (includes creation as InProgress).
    TxnStateChange { txn_id: TxnId, state: TxnState },
    /// A write intent was finalized at its holding partition.
    Finalize {
        key: Key,
        txn_id: TxnId,
        action: EndAction,
    },
    /// The transaction record was deleted after all finalize acks. Durable so
    /// a recovered record cannot resurrect a finalized transaction.
    TxnRecordDelete { txn_id: TxnId },
}

/// Append-only persistence log. One per partition; appends are serialized by
/// the caller's executor, so implementations only need internal consistency.
#[async_trait]
pub trait Plog: Send + Sync {
    /// Append an entry and return its log offset.
    async fn append(&self, entry: PlogEntry) -> KestrelResult<u64>;

    /// Make all appended entries durable.
    async fn flush(&self) -> KestrelResult<()>;
}

/// In-memory log for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemPlog {
    entries: Mutex<Vec<PlogEntry>>,
}

impl MemPlog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything appended so far.
    pub fn entries(&self) -> Vec<PlogEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl Plog for MemPlog {
    async fn append(&self, entry: PlogEntry) -> KestrelResult<u64> {
        let mut entries = self.entries.lock();
        entries.push(entry);
        Ok(entries.len() as u64 - 1)
    }

    async fn flush(&self) -> KestrelResult<()> {
        Ok(())
    }
}

/// File-backed log: rotating segments of `[len:4][crc32:4][bincode]` frames
/// behind a magic/version header.
pub struct FilePlog {
    inner: Mutex<FilePlogInner>,
    offset: AtomicU64,
    sync_on_flush: bool,
    max_segment_size: u64,
}

struct FilePlogInner {
    writer: BufWriter<File>,
    dir: PathBuf,
    current_segment: u64,
    current_segment_size: u64,
}

fn segment_filename(segment_id: u64) -> String {
    format!("kestrel_{segment_id:06}.plog")
}

impl FilePlog {
    pub fn open(dir: &Path, sync_on_flush: bool) -> KestrelResult<Self> {
        Self::open_with_segment_size(dir, sync_on_flush, DEFAULT_SEGMENT_SIZE)
    }

    pub fn open_with_segment_size(
        dir: &Path,
        sync_on_flush: bool,
        max_segment_size: u64,
    ) -> KestrelResult<Self> {
        fs::create_dir_all(dir)?;
        let segment_id = Self::find_latest_segment(dir).unwrap_or(0);
        let path = dir.join(segment_filename(segment_id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        let mut writer = BufWriter::new(file);
        let current_segment_size = if len == 0 {
            writer.write_all(PLOG_MAGIC)?;
            writer.write_all(&PLOG_FORMAT_VERSION.to_le_bytes())?;
            writer.flush()?;
            PLOG_SEGMENT_HEADER_SIZE as u64
        } else {
            len
        };
        Ok(Self {
            inner: Mutex::new(FilePlogInner {
                writer,
                dir: dir.to_path_buf(),
                current_segment: segment_id,
                current_segment_size,
            }),
            offset: AtomicU64::new(0),
            sync_on_flush,
            max_segment_size,
        })
    }

    fn find_latest_segment(dir: &Path) -> Option<u64> {
        let mut max_id = None;
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(id) = name
                    .strip_prefix("kestrel_")
                    .and_then(|n| n.strip_suffix(".plog"))
                    .and_then(|n| n.parse::<u64>().ok())
                {
                    max_id = Some(max_id.map_or(id, |cur: u64| cur.max(id)));
                }
            }
        }
        max_id
    }

    fn rotate_segment(&self, inner: &mut FilePlogInner) -> KestrelResult<()> {
        inner.writer.flush()?;
        if self.sync_on_flush {
            inner.writer.get_ref().sync_data()?;
        }
        inner.current_segment += 1;
        let path = inner.dir.join(segment_filename(inner.current_segment));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        inner.writer = BufWriter::new(file);
        inner.writer.write_all(PLOG_MAGIC)?;
        inner.writer.write_all(&PLOG_FORMAT_VERSION.to_le_bytes())?;
        inner.current_segment_size = PLOG_SEGMENT_HEADER_SIZE as u64;
        tracing::debug!(segment = inner.current_segment, "plog rotated");
        Ok(())
    }
}

#[async_trait]
impl Plog for FilePlog {
    async fn append(&self, entry: PlogEntry) -> KestrelResult<u64> {
        let data = bincode::serialize(&entry)
            .map_err(|e| KestrelError::Serialization(e.to_string()))?;
        let checksum = crc32fast::hash(&data);
        let frame_size = 8 + data.len() as u64;

        let mut inner = self.inner.lock();
        if inner.current_segment_size + frame_size > self.max_segment_size {
            self.rotate_segment(&mut inner)?;
        }
        inner.writer.write_all(&(data.len() as u32).to_le_bytes())?;
        inner.writer.write_all(&checksum.to_le_bytes())?;
        inner.writer.write_all(&data)?;
        inner.current_segment_size += frame_size;
        Ok(self.offset.fetch_add(1, Ordering::SeqCst))
    }

    async fn flush(&self) -> KestrelResult<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        if self.sync_on_flush {
            inner.writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

/// Read back every entry across all segments, in append order. Used by tests
/// and offline inspection; stops at the first corrupt frame.
pub fn read_plog_entries(dir: &Path) -> KestrelResult<Vec<PlogEntry>> {
    let mut segment_ids: Vec<u64> = Vec::new();
    for entry in fs::read_dir(dir)?.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(id) = name
            .strip_prefix("kestrel_")
            .and_then(|n| n.strip_suffix(".plog"))
            .and_then(|n| n.parse::<u64>().ok())
        {
            segment_ids.push(id);
        }
    }
    segment_ids.sort_unstable();

    let mut entries = Vec::new();
    for id in segment_ids {
        let mut buf = Vec::new();
        File::open(dir.join(segment_filename(id)))?.read_to_end(&mut buf)?;
        if buf.len() < PLOG_SEGMENT_HEADER_SIZE || &buf[0..4] != PLOG_MAGIC {
            return Err(KestrelError::Serialization(format!(
                "segment {id} has a bad header"
            )));
        }
        let mut pos = PLOG_SEGMENT_HEADER_SIZE;
        while pos + 8 <= buf.len() {
            let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            let checksum = u32::from_le_bytes(buf[pos + 4..pos + 8].try_into().unwrap());
            pos += 8;
            if pos + len > buf.len() {
                return Ok(entries); // torn tail frame
            }
            let data = &buf[pos..pos + len];
            if crc32fast::hash(data) != checksum {
                return Ok(entries);
            }
            let entry: PlogEntry = bincode::deserialize(data)
                .map_err(|e| KestrelError::Serialization(e.to_string()))?;
            entries.push(entry);
            pos += len;
        }
    }
    Ok(entries)
}
