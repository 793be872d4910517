#![forbid(unsafe_code)]
//! On-storage layout for ForkFS.
//!
//! Everything here is little-endian at fixed offsets:
//!
//! ```text
//! [ Superblock (4K) | Branch table | Base image (optional) | Delta region ]
//! ```
//!
//! The superblock and branch records are parsed and encoded field by field;
//! delta log records decode into a tagged [`record::DeltaRecord`] variant so
//! that `total_size` plus the type tag drive all payload slicing.

pub mod base;
pub mod format;
pub mod record;

use forkfs_types::{
    BRANCH_NAME_MAX, BRANCH_RECORD_SIZE, BranchId, ByteOffset, FORKFS_BLOCK_SIZE, FORKFS_MAGIC,
    FORKFS_VERSION, MAX_BRANCHES, ParseError, SUPERBLOCK_SIZE, ensure_slice, put_bytes,
    read_fixed, read_le_u32, read_le_u64, trim_nul_padded, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

/// Name of the bootstrap branch created when an image is formatted.
pub const MAIN_BRANCH: &str = "main";

/// Outer superblock, one block at offset 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub flags: u32,
    pub block_size: u32,
    pub total_size: u64,
    pub base_offset: u64,
    pub base_size: u64,
    pub branch_table_offset: u64,
    pub branch_table_entries: u32,
    pub active_branches: u32,
    pub next_branch_id: u64,
    pub next_inode_id: u64,
    pub delta_region_offset: u64,
    pub delta_region_size: u64,
    pub delta_alloc_offset: u64,
}

impl Superblock {
    /// Window offset of the `active_branches` counter.
    pub const ACTIVE_BRANCHES_FIELD: u64 = 52;
    /// Window offset of the `next_branch_id` counter.
    pub const NEXT_BRANCH_ID_FIELD: u64 = 56;
    /// Window offset of the `next_inode_id` counter.
    pub const NEXT_INODE_ID_FIELD: u64 = 64;
    /// Window offset of the `delta_alloc_offset` counter.
    pub const DELTA_ALLOC_FIELD: u64 = 88;

    /// Parse the superblock from its 4096-byte region.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u32(region, 0)?;
        if magic != FORKFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(FORKFS_MAGIC),
                actual: u64::from(magic),
            });
        }

        let version = read_le_u32(region, 4)?;
        if version != FORKFS_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported format version",
            });
        }

        let block_size = read_le_u32(region, 12)?;
        if block_size != FORKFS_BLOCK_SIZE {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be 4096",
            });
        }

        let branch_table_entries = read_le_u32(region, 48)?;
        if branch_table_entries == 0 || branch_table_entries > MAX_BRANCHES {
            return Err(ParseError::InvalidField {
                field: "branch_table_entries",
                reason: "must be in 1..=256",
            });
        }

        Ok(Self {
            flags: read_le_u32(region, 8)?,
            block_size,
            total_size: read_le_u64(region, 16)?,
            base_offset: read_le_u64(region, 24)?,
            base_size: read_le_u64(region, 32)?,
            branch_table_offset: read_le_u64(region, 40)?,
            branch_table_entries,
            active_branches: read_le_u32(region, 52)?,
            next_branch_id: read_le_u64(region, 56)?,
            next_inode_id: read_le_u64(region, 64)?,
            delta_region_offset: read_le_u64(region, 72)?,
            delta_region_size: read_le_u64(region, 80)?,
            delta_alloc_offset: read_le_u64(region, 88)?,
        })
    }

    /// Encode into a fresh 4096-byte region (reserved tail zeroed).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        // Buffer is sized above; the write helpers cannot fail.
        let _ = write_le_u32(&mut region, 0, FORKFS_MAGIC);
        let _ = write_le_u32(&mut region, 4, FORKFS_VERSION);
        let _ = write_le_u32(&mut region, 8, self.flags);
        let _ = write_le_u32(&mut region, 12, self.block_size);
        let _ = write_le_u64(&mut region, 16, self.total_size);
        let _ = write_le_u64(&mut region, 24, self.base_offset);
        let _ = write_le_u64(&mut region, 32, self.base_size);
        let _ = write_le_u64(&mut region, 40, self.branch_table_offset);
        let _ = write_le_u32(&mut region, 48, self.branch_table_entries);
        let _ = write_le_u32(&mut region, 52, self.active_branches);
        let _ = write_le_u64(&mut region, 56, self.next_branch_id);
        let _ = write_le_u64(&mut region, 64, self.next_inode_id);
        let _ = write_le_u64(&mut region, 72, self.delta_region_offset);
        let _ = write_le_u64(&mut region, 80, self.delta_region_size);
        let _ = write_le_u64(&mut region, 88, self.delta_alloc_offset);
        region
    }

    /// Window offset of branch table slot `index`.
    pub fn branch_slot_offset(&self, index: u32) -> Result<ByteOffset, ParseError> {
        if index >= self.branch_table_entries {
            return Err(ParseError::InvalidField {
                field: "branch_slot",
                reason: "index past branch table",
            });
        }
        let record_size = u64::try_from(BRANCH_RECORD_SIZE)
            .map_err(|_| ParseError::IntegerConversion { field: "record_size" })?;
        let rel = u64::from(index)
            .checked_mul(record_size)
            .ok_or(ParseError::IntegerConversion { field: "branch_slot" })?;
        self.branch_table_offset
            .checked_add(rel)
            .map(ByteOffset)
            .ok_or(ParseError::IntegerConversion { field: "branch_slot" })
    }

    /// End of the delta region (exclusive).
    #[must_use]
    pub fn delta_region_end(&self) -> u64 {
        self.delta_region_offset
            .saturating_add(self.delta_region_size)
    }
}

/// Branch lifecycle state as stored in the branch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchState {
    Free,
    Active,
    Committed,
    Aborted,
}

impl BranchState {
    pub fn from_raw(raw: u32) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Free),
            1 => Ok(Self::Active),
            2 => Ok(Self::Committed),
            3 => Ok(Self::Aborted),
            _ => Err(ParseError::InvalidField {
                field: "branch_state",
                reason: "unknown state value",
            }),
        }
    }

    #[must_use]
    pub fn as_raw(self) -> u32 {
        match self {
            Self::Free => 0,
            Self::Active => 1,
            Self::Committed => 2,
            Self::Aborted => 3,
        }
    }

    /// COMMITTED and ABORTED are terminal; FREE slots hold no branch.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// One 128-byte branch table record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub branch_id: BranchId,
    pub parent_id: BranchId,
    pub delta_log_offset: u64,
    pub delta_log_size: u64,
    pub delta_log_capacity: u64,
    pub state: BranchState,
    pub refcount: u32,
    pub next_local_ino: u64,
    pub name: String,
}

impl BranchRecord {
    /// Field offsets within the record, for single-field updates.
    pub const DELTA_LOG_SIZE_FIELD: u64 = 24;
    pub const STATE_FIELD: u64 = 40;
    pub const REFCOUNT_FIELD: u64 = 44;
    pub const NEXT_LOCAL_INO_FIELD: u64 = 48;

    pub fn parse(record: &[u8]) -> Result<Self, ParseError> {
        if record.len() < BRANCH_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BRANCH_RECORD_SIZE,
                offset: 0,
                actual: record.len(),
            });
        }

        Ok(Self {
            branch_id: BranchId(read_le_u64(record, 0)?),
            parent_id: BranchId(read_le_u64(record, 8)?),
            delta_log_offset: read_le_u64(record, 16)?,
            delta_log_size: read_le_u64(record, 24)?,
            delta_log_capacity: read_le_u64(record, 32)?,
            state: BranchState::from_raw(read_le_u32(record, 40)?)?,
            refcount: read_le_u32(record, 44)?,
            next_local_ino: read_le_u64(record, 48)?,
            name: trim_nul_padded(&read_fixed::<32>(record, 56)?),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let name = self.name.as_bytes();
        if name.len() > BRANCH_NAME_MAX {
            return Err(ParseError::InvalidField {
                field: "branch_name",
                reason: "exceeds 31 bytes",
            });
        }

        let mut record = vec![0_u8; BRANCH_RECORD_SIZE];
        write_le_u64(&mut record, 0, self.branch_id.0)?;
        write_le_u64(&mut record, 8, self.parent_id.0)?;
        write_le_u64(&mut record, 16, self.delta_log_offset)?;
        write_le_u64(&mut record, 24, self.delta_log_size)?;
        write_le_u64(&mut record, 32, self.delta_log_capacity)?;
        write_le_u32(&mut record, 40, self.state.as_raw())?;
        write_le_u32(&mut record, 44, self.refcount)?;
        write_le_u64(&mut record, 48, self.next_local_ino)?;
        put_bytes(&mut record, 56, name)?;
        Ok(record)
    }

    /// A slot holds a live branch when it is not FREE.
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.state != BranchState::Free && self.branch_id.0 != 0
    }
}

/// Parse all records of a branch table region.
pub fn parse_branch_table(region: &[u8], entries: u32) -> Result<Vec<BranchRecord>, ParseError> {
    let entries = forkfs_types::u64_to_usize(u64::from(entries), "branch_table_entries")?;
    let mut records = Vec::with_capacity(entries);
    for index in 0..entries {
        let offset = index
            .checked_mul(BRANCH_RECORD_SIZE)
            .ok_or(ParseError::IntegerConversion { field: "branch_table" })?;
        records.push(BranchRecord::parse(ensure_slice(
            region,
            offset,
            BRANCH_RECORD_SIZE,
        )?)?);
    }
    Ok(records)
}
