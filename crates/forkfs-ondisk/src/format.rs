//! Image formatting.
//!
//! Lays out a fresh ForkFS image in a storage window: superblock, branch
//! table, optional base image, and a zeroed delta region. A formatted image
//! always carries one ACTIVE branch named `main` holding the first reserved
//! sub-range of the delta region.

use crate::base::BaseSuperblock;
use crate::{BranchRecord, BranchState, MAIN_BRANCH, Superblock};
use forkfs_error::{ForkFsError, Result};
use forkfs_types::{
    BRANCH_RECORD_SIZE, BranchId, ByteOffset, FORKFS_BLOCK_SIZE, MAX_BRANCHES, SUPERBLOCK_SIZE,
    align_up,
};
use forkfs_window::{Window, zero_range};
use tracing::info;

/// Default capacity reserved for each branch's delta log.
pub const DEFAULT_BRANCH_CAPACITY: u64 = 1024 * 1024;

/// Align a byte offset up to the filesystem block size.
pub fn align_block(offset: u64) -> Result<u64> {
    align_up(offset, u64::from(FORKFS_BLOCK_SIZE))
        .ok_or(ForkFsError::Invalid("offset overflows block alignment"))
}

#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Optional base image bytes (from [`crate::base::BaseImageBuilder`]).
    pub base_image: Option<Vec<u8>>,
    /// Delta log capacity reserved for the bootstrap `main` branch.
    pub main_log_capacity: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            base_image: None,
            main_log_capacity: DEFAULT_BRANCH_CAPACITY,
        }
    }
}

/// Format `window` as a fresh ForkFS image and return its superblock.
pub fn format_image(window: &dyn Window, opts: &FormatOptions) -> Result<Superblock> {
    let total_size = window.len();

    let branch_table_offset = u64::try_from(SUPERBLOCK_SIZE)
        .map_err(|_| ForkFsError::Invalid("superblock size overflows u64"))?;
    let table_bytes = u64::from(MAX_BRANCHES)
        * u64::try_from(BRANCH_RECORD_SIZE)
            .map_err(|_| ForkFsError::Invalid("record size overflows u64"))?;
    let after_table = branch_table_offset + table_bytes;

    // Base image directly after the table (the table end is block-aligned).
    let (base_offset, base_size, base_inode_count) = match &opts.base_image {
        Some(bytes) => {
            let base_sb = BaseSuperblock::parse(bytes)?;
            let size = u64::try_from(bytes.len())
                .map_err(|_| ForkFsError::Invalid("base image size overflows u64"))?;
            if base_sb.total_size != size {
                return Err(ForkFsError::Invalid(
                    "base image total_size disagrees with byte length",
                ));
            }
            (after_table, size, base_sb.inode_count)
        }
        None => (0, 0, 0),
    };

    let delta_region_offset = align_block(after_table + base_size)?;
    if total_size <= delta_region_offset {
        return Err(ForkFsError::NoSpace);
    }
    let delta_region_size = total_size - delta_region_offset;
    let main_capacity = opts.main_log_capacity.min(delta_region_size);
    if main_capacity == 0 {
        return Err(ForkFsError::NoSpace);
    }

    // Delta region must read as freshly zeroed; the first zero-size record
    // header is the end-of-log marker.
    zero_range(window, ByteOffset(delta_region_offset), delta_region_size)?;
    zero_range(window, ByteOffset(branch_table_offset), table_bytes)?;

    if let Some(bytes) = &opts.base_image {
        window.write_all_at(ByteOffset(base_offset), bytes)?;
    }

    let main = BranchRecord {
        branch_id: BranchId(1),
        parent_id: BranchId::NONE,
        delta_log_offset: delta_region_offset,
        delta_log_size: 0,
        delta_log_capacity: main_capacity,
        state: BranchState::Active,
        refcount: 1,
        next_local_ino: u64::from(base_inode_count) + 1,
        name: MAIN_BRANCH.to_owned(),
    };
    window.write_all_at(ByteOffset(branch_table_offset), &main.encode()?)?;

    let sb = Superblock {
        flags: 0,
        block_size: FORKFS_BLOCK_SIZE,
        total_size,
        base_offset,
        base_size,
        branch_table_offset,
        branch_table_entries: MAX_BRANCHES,
        active_branches: 1,
        next_branch_id: 2,
        next_inode_id: (u64::from(base_inode_count) + 1).max(2),
        delta_region_offset,
        delta_region_size,
        delta_alloc_offset: delta_region_offset + main_capacity,
    };
    window.write_all_at(ByteOffset::ZERO, &sb.encode())?;
    window.sync(ByteOffset::ZERO, sb.total_size)?;

    info!(
        target: "forkfs::format",
        total_size,
        base_size,
        delta_region_size,
        main_capacity,
        "image formatted"
    );
    Ok(sb)
}
