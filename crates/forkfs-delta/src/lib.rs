#![forbid(unsafe_code)]
//! Per-branch delta logs.
//!
//! Each branch owns one append-only record stream inside its reserved
//! sub-range of the delta region, plus two in-memory indices rebuilt on
//! open: an inode index and a dirent index. Records are immutable once
//! appended; the indices only ever advance to reference a later record for
//! the same key.

pub mod alloc;

pub use alloc::RegionAllocator;

use forkfs_error::{ForkFsError, Result};
use forkfs_ondisk::BranchRecord;
use forkfs_ondisk::record::{
    ATTR_GID, ATTR_MODE, ATTR_SIZE, ATTR_UID, DeltaRecord, LogIter, WRITE_DATA_OFFSET,
};
use forkfs_types::{ByteOffset, InodeNumber, u64_to_usize};
use forkfs_window::Window;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Latest known state of an inode within one branch.
///
/// Fields a record did not carry stay `None`; the resolver merges them from
/// deeper branches or the base image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeState {
    /// Branch-relative offset of the deciding record.
    pub record_offset: u64,
    pub deleted: bool,
    pub size: Option<u64>,
    /// `true` when `size` was set outright (create, truncate, setattr);
    /// `false` when it only grew from write extents, making it a lower
    /// bound that a larger ancestor or base size still overrides.
    pub size_exact: bool,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Timestamp of the latest record touching this inode.
    pub mtime: u64,
}

impl InodeState {
    fn new(record_offset: u64, mtime: u64) -> Self {
        Self {
            record_offset,
            deleted: false,
            size: None,
            size_exact: false,
            mode: None,
            uid: None,
            gid: None,
            mtime,
        }
    }
}

/// Latest decision for a `(parent, name)` pair within one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirentState {
    /// Branch-relative offset of the deciding record.
    pub record_offset: u64,
    /// `true` when the name does not exist here (tombstone / rename-away).
    pub deleted: bool,
    /// The inode the name resolves to when not deleted.
    pub ino: InodeNumber,
}

/// A resolved WRITE chunk: absolute window offset of the data covering the
/// requested position, and how many bytes of it apply before a later write
/// takes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteChunk {
    pub data_offset: ByteOffset,
    pub avail: u64,
}

#[derive(Debug, Default)]
struct BranchIndexes {
    // Totally ordered by (parent, name bytes): deleted-then-reinserted
    // names stay unambiguous without hash tie-breaking.
    inode: BTreeMap<InodeNumber, InodeState>,
    dirent: BTreeMap<(InodeNumber, Box<[u8]>), DirentState>,
}

/// One branch's append-only delta log plus its in-memory indices.
pub struct DeltaLog {
    window: Arc<dyn Window>,
    /// Absolute window offset of the log's first byte.
    log_offset: ByteOffset,
    capacity: u64,
    /// Absolute window offset of the owning branch table record, for
    /// persisting `delta_log_size` on publication.
    slot_offset: ByteOffset,
    used: Mutex<u64>,
    indexes: Mutex<BranchIndexes>,
}

impl DeltaLog {
    #[must_use]
    pub fn new(
        window: Arc<dyn Window>,
        log_offset: ByteOffset,
        capacity: u64,
        slot_offset: ByteOffset,
        used: u64,
    ) -> Self {
        Self {
            window,
            log_offset,
            capacity,
            slot_offset,
            used: Mutex::new(used),
            indexes: Mutex::new(BranchIndexes::default()),
        }
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        *self.used.lock()
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Append one record and update both indices; the new size is persisted
    /// and published only after the bytes and the index entries are in
    /// place, so no observer sees a record without its index entry.
    pub fn append(
        &self,
        record: &DeltaRecord<'_>,
        ino: InodeNumber,
        timestamp: u64,
    ) -> Result<u64> {
        let bytes = record.encode(ino, timestamp)?;
        let len = u64::try_from(bytes.len())
            .map_err(|_| ForkFsError::Invalid("record length overflows u64"))?;

        let mut used = self.used.lock();
        let record_offset = *used;
        let new_size = record_offset
            .checked_add(len)
            .ok_or(ForkFsError::Invalid("log size overflows u64"))?;
        if new_size > self.capacity {
            warn!(
                target: "forkfs::delta",
                used = record_offset,
                record_len = len,
                capacity = self.capacity,
                "branch delta log full"
            );
            return Err(ForkFsError::NoSpace);
        }

        let abs = self
            .log_offset
            .checked_add(record_offset)
            .ok_or(ForkFsError::Invalid("log offset overflows u64"))?;
        self.window.write_all_at(abs, &bytes)?;

        {
            let mut indexes = self.indexes.lock();
            Self::apply(&mut indexes, record_offset, ino, timestamp, record);
        }

        self.persist_size(new_size)?;
        *used = new_size;
        debug!(
            target: "forkfs::delta",
            record_type = record.record_type(),
            ino = ino.0,
            record_offset,
            total = len,
            "record appended"
        );
        Ok(record_offset)
    }

    /// Append pre-encoded records verbatim (commit merge). Indices are not
    /// touched; the caller rebuilds them afterwards.
    pub fn append_raw(&self, bytes: &[u8]) -> Result<()> {
        let len = u64::try_from(bytes.len())
            .map_err(|_| ForkFsError::Invalid("merge length overflows u64"))?;
        let mut used = self.used.lock();
        let new_size = used
            .checked_add(len)
            .ok_or(ForkFsError::Invalid("log size overflows u64"))?;
        if new_size > self.capacity {
            return Err(ForkFsError::NoSpace);
        }
        let abs = self
            .log_offset
            .checked_add(*used)
            .ok_or(ForkFsError::Invalid("log offset overflows u64"))?;
        self.window.write_all_at(abs, bytes)?;
        self.persist_size(new_size)?;
        *used = new_size;
        Ok(())
    }

    fn persist_size(&self, new_size: u64) -> Result<()> {
        let field = self
            .slot_offset
            .checked_add(BranchRecord::DELTA_LOG_SIZE_FIELD)
            .ok_or(ForkFsError::Invalid("slot offset overflows u64"))?;
        self.window.write_all_at(field, &new_size.to_le_bytes())
    }

    /// Snapshot the used log bytes for a scan.
    pub fn read_log(&self) -> Result<Vec<u8>> {
        let used = self.used();
        let mut bytes = vec![0_u8; u64_to_usize(used, "delta_log_size")?];
        if used > 0 {
            self.window.read_exact_at(self.log_offset, &mut bytes)?;
        }
        Ok(bytes)
    }

    /// Rebuild both indices from the raw log. Idempotent; stops at the
    /// first zero-sized record. A record overrunning the used size is
    /// reported as corruption (the caller aborts the branch).
    pub fn build_index(&self) -> Result<()> {
        let log = self.read_log()?;
        let mut fresh = BranchIndexes::default();
        let mut records = 0_u64;
        for entry in LogIter::new(&log) {
            let entry = entry.map_err(|err| ForkFsError::Corruption {
                offset: self.log_offset.0,
                detail: format!("delta log scan failed: {err}"),
            })?;
            match entry.record {
                Some(record) => {
                    Self::apply(
                        &mut fresh,
                        entry.offset,
                        entry.header.ino,
                        entry.header.timestamp,
                        &record,
                    );
                    records += 1;
                }
                None => {
                    warn!(
                        target: "forkfs::delta",
                        record_type = entry.header.record_type,
                        offset = entry.offset,
                        "skipping record with unknown type"
                    );
                }
            }
        }
        *self.indexes.lock() = fresh;
        debug!(target: "forkfs::delta", records, used = self.used(), "index rebuilt");
        Ok(())
    }

    /// Drop both indices (branch abort).
    pub fn drop_indexes(&self) {
        *self.indexes.lock() = BranchIndexes::default();
    }

    fn apply(
        indexes: &mut BranchIndexes,
        record_offset: u64,
        header_ino: InodeNumber,
        timestamp: u64,
        record: &DeltaRecord<'_>,
    ) {
        match record {
            DeltaRecord::Create {
                parent,
                new_ino,
                mode,
                name,
                ..
            }
            | DeltaRecord::Mkdir {
                parent,
                new_ino,
                mode,
                name,
                ..
            } => {
                let entry = indexes
                    .inode
                    .entry(*new_ino)
                    .or_insert_with(|| InodeState::new(record_offset, timestamp));
                entry.record_offset = record_offset;
                entry.deleted = false;
                entry.size = Some(0);
                entry.size_exact = true;
                entry.mode = Some(*mode);
                entry.mtime = timestamp;
                indexes.dirent.insert(
                    (*parent, Box::from(*name)),
                    DirentState {
                        record_offset,
                        deleted: false,
                        ino: *new_ino,
                    },
                );
            }
            DeltaRecord::Delete { parent, name, .. } => {
                let entry = indexes
                    .inode
                    .entry(header_ino)
                    .or_insert_with(|| InodeState::new(record_offset, timestamp));
                entry.record_offset = record_offset;
                entry.deleted = true;
                entry.mtime = timestamp;
                indexes.dirent.insert(
                    (*parent, Box::from(*name)),
                    DirentState {
                        record_offset,
                        deleted: true,
                        ino: header_ino,
                    },
                );
            }
            DeltaRecord::Truncate { new_size } => {
                let entry = indexes
                    .inode
                    .entry(header_ino)
                    .or_insert_with(|| InodeState::new(record_offset, timestamp));
                entry.record_offset = record_offset;
                entry.deleted = false;
                entry.size = Some(*new_size);
                entry.size_exact = true;
                entry.mtime = timestamp;
            }
            DeltaRecord::Write { offset, data, .. } => {
                let end = offset.saturating_add(u64::try_from(data.len()).unwrap_or(u64::MAX));
                let entry = indexes
                    .inode
                    .entry(header_ino)
                    .or_insert_with(|| InodeState::new(record_offset, timestamp));
                entry.record_offset = record_offset;
                entry.deleted = false;
                entry.size = Some(entry.size.map_or(end, |size| size.max(end)));
                entry.mtime = timestamp;
            }
            DeltaRecord::SetAttr {
                mode,
                uid,
                gid,
                valid,
                size,
            } => {
                let entry = indexes
                    .inode
                    .entry(header_ino)
                    .or_insert_with(|| InodeState::new(record_offset, timestamp));
                entry.record_offset = record_offset;
                entry.deleted = false;
                if valid & ATTR_SIZE != 0 {
                    entry.size = Some(*size);
                    entry.size_exact = true;
                }
                if valid & ATTR_MODE != 0 {
                    entry.mode = Some(*mode);
                }
                if valid & ATTR_UID != 0 {
                    entry.uid = Some(*uid);
                }
                if valid & ATTR_GID != 0 {
                    entry.gid = Some(*gid);
                }
                entry.mtime = timestamp;
            }
            DeltaRecord::Rename {
                old_parent,
                new_parent,
                ino,
                old_name,
                new_name,
            } => {
                indexes.dirent.insert(
                    (*old_parent, Box::from(*old_name)),
                    DirentState {
                        record_offset,
                        deleted: true,
                        ino: *ino,
                    },
                );
                indexes.dirent.insert(
                    (*new_parent, Box::from(*new_name)),
                    DirentState {
                        record_offset,
                        deleted: false,
                        ino: *ino,
                    },
                );
            }
        }
        trace!(
            target: "forkfs::delta",
            record_type = record.record_type(),
            record_offset,
            "index updated"
        );
    }

    #[must_use]
    pub fn lookup_inode(&self, ino: InodeNumber) -> Option<InodeState> {
        self.indexes.lock().inode.get(&ino).copied()
    }

    #[must_use]
    pub fn lookup_dirent(&self, parent: InodeNumber, name: &[u8]) -> Option<DirentState> {
        self.indexes
            .lock()
            .dirent
            .get(&(parent, Box::from(name)))
            .copied()
    }

    #[must_use]
    pub fn is_deleted(&self, ino: InodeNumber) -> bool {
        self.indexes
            .lock()
            .inode
            .get(&ino)
            .is_some_and(|entry| entry.deleted)
    }

    #[must_use]
    pub fn get_size(&self, ino: InodeNumber) -> Option<u64> {
        self.indexes.lock().inode.get(&ino).and_then(|e| e.size)
    }

    /// Find the WRITE covering `pos` for `ino`. The latest covering record
    /// wins; its chunk is clamped where a still-later write starts inside
    /// it, so overlapping writes resolve byte-wise latest-first.
    pub fn resolve_write(&self, ino: InodeNumber, pos: u64) -> Result<Option<WriteChunk>> {
        let log = self.read_log()?;
        let mut chosen: Option<(u64, u64)> = None; // (data offset in log, limit)
        for entry in LogIter::new(&log) {
            let entry = entry.map_err(|err| ForkFsError::Corruption {
                offset: self.log_offset.0,
                detail: format!("delta log scan failed: {err}"),
            })?;
            if entry.header.ino != ino {
                continue;
            }
            let Some(DeltaRecord::Write { offset, data, .. }) = entry.record else {
                continue;
            };
            let len = u64::try_from(data.len()).unwrap_or(u64::MAX);
            let end = offset.saturating_add(len);
            if pos >= offset && pos < end {
                let data_start = u64::try_from(WRITE_DATA_OFFSET).unwrap_or(u64::MAX);
                let data_at = entry.offset + data_start + (pos - offset);
                chosen = Some((data_at, end));
            } else if let Some((_, limit)) = &mut chosen
                && offset > pos
                && offset < *limit
            {
                // A later write begins inside the chosen chunk: it owns the
                // tail bytes from its start onward.
                *limit = offset;
            }
        }

        Ok(match chosen {
            Some((data_at, limit)) => Some(WriteChunk {
                data_offset: self
                    .log_offset
                    .checked_add(data_at)
                    .ok_or(ForkFsError::Invalid("data offset overflows u64"))?,
                avail: limit - pos,
            }),
            None => None,
        })
    }

    /// Smallest WRITE start offset for `ino` strictly inside `(lo, hi)`.
    ///
    /// Used by the resolver to clamp chunks served from an ancestor branch
    /// or the base image against leafward writes.
    pub fn min_write_start_in(&self, ino: InodeNumber, lo: u64, hi: u64) -> Result<Option<u64>> {
        let log = self.read_log()?;
        let mut min: Option<u64> = None;
        for entry in LogIter::new(&log) {
            let entry = entry.map_err(|err| ForkFsError::Corruption {
                offset: self.log_offset.0,
                detail: format!("delta log scan failed: {err}"),
            })?;
            if entry.header.ino != ino {
                continue;
            }
            let Some(DeltaRecord::Write { offset, .. }) = entry.record else {
                continue;
            };
            if offset > lo && offset < hi {
                min = Some(min.map_or(offset, |m| m.min(offset)));
            }
        }
        Ok(min)
    }

    /// Sum of `total_size` over all records (diagnostic; equals `used()`
    /// for a healthy log).
    pub fn scan_total(&self) -> Result<u64> {
        let log = self.read_log()?;
        let mut total = 0_u64;
        for entry in LogIter::new(&log) {
            let entry = entry.map_err(|err| ForkFsError::Corruption {
                offset: self.log_offset.0,
                detail: format!("delta log scan failed: {err}"),
            })?;
            total += u64::from(entry.header.total_size);
        }
        Ok(total)
    }

    /// Number of live index entries `(inodes, dirents)` (diagnostic).
    #[must_use]
    pub fn index_sizes(&self) -> (usize, usize) {
        let indexes = self.indexes.lock();
        (indexes.inode.len(), indexes.dirent.len())
    }

    /// Clone of the inode index (diagnostic / tests).
    #[must_use]
    pub fn inode_index_snapshot(&self) -> BTreeMap<InodeNumber, InodeState> {
        self.indexes.lock().inode.clone()
    }

    /// Clone of the dirent index (diagnostic / tests).
    #[must_use]
    pub fn dirent_index_snapshot(&self) -> BTreeMap<(InodeNumber, Box<[u8]>), DirentState> {
        self.indexes.lock().dirent.clone()
    }
}
