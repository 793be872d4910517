//! Branch contexts.
//!
//! A [`BranchCtx`] is the in-memory face of one branch table record: the
//! branch's delta log, its lifecycle state, and its refcount. Single-field
//! updates are persisted through the window at the record's fixed offsets.
//! Staleness (sibling invalidation) is runtime-only state; it never
//! re-activates and is re-derived from commit activity, not storage.

use forkfs_delta::DeltaLog;
use forkfs_error::{ForkFsError, Result};
use forkfs_ondisk::{BranchRecord, BranchState, Superblock};
use forkfs_types::{BranchId, ByteOffset};
use forkfs_window::Window;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

pub struct BranchCtx {
    pub id: BranchId,
    pub parent_id: BranchId,
    pub slot: u32,
    pub name: String,
    slot_offset: ByteOffset,
    window: Arc<dyn Window>,
    state: Mutex<BranchState>,
    stale: AtomicBool,
    refcount: Mutex<u32>,
    next_local_ino: Mutex<u64>,
    pub log: DeltaLog,
}

impl BranchCtx {
    /// Materialize a context from a parsed branch table record.
    pub fn from_record(
        window: Arc<dyn Window>,
        sb: &Superblock,
        slot: u32,
        record: &BranchRecord,
    ) -> Result<Self> {
        let slot_offset = sb.branch_slot_offset(slot)?;
        let log = DeltaLog::new(
            Arc::clone(&window),
            ByteOffset(record.delta_log_offset),
            record.delta_log_capacity,
            slot_offset,
            record.delta_log_size,
        );
        Ok(Self {
            id: record.branch_id,
            parent_id: record.parent_id,
            slot,
            name: record.name.clone(),
            slot_offset,
            window,
            state: Mutex::new(record.state),
            stale: AtomicBool::new(false),
            refcount: Mutex::new(record.refcount),
            next_local_ino: Mutex::new(record.next_local_ino),
            log,
        })
    }

    #[must_use]
    pub fn state(&self) -> BranchState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Mark this branch logically stale. One-way: a sibling's commit broke
    /// the assumptions this branch inherited, and they cannot be restored.
    pub fn invalidate(&self) {
        if !self.stale.swap(true, Ordering::AcqRel) {
            info!(
                target: "forkfs::branch",
                branch = %self.name,
                id = self.id.0,
                "branch invalidated by sibling commit"
            );
        }
    }

    /// Transition to `state` and persist the record field.
    pub fn set_state(&self, state: BranchState) -> Result<()> {
        let mut current = self.state.lock();
        if current.is_terminal() && state != *current {
            return Err(ForkFsError::Stale);
        }
        self.write_field_u32(BranchRecord::STATE_FIELD, state.as_raw())?;
        *current = state;
        Ok(())
    }

    #[must_use]
    pub fn refcount(&self) -> u32 {
        *self.refcount.lock()
    }

    pub fn refcount_inc(&self) -> Result<u32> {
        let mut count = self.refcount.lock();
        let next = count
            .checked_add(1)
            .ok_or(ForkFsError::Invalid("branch refcount overflows u32"))?;
        self.write_field_u32(BranchRecord::REFCOUNT_FIELD, next)?;
        *count = next;
        Ok(next)
    }

    pub fn refcount_dec(&self) -> Result<u32> {
        let mut count = self.refcount.lock();
        let next = count.saturating_sub(1);
        self.write_field_u32(BranchRecord::REFCOUNT_FIELD, next)?;
        *count = next;
        Ok(next)
    }

    #[must_use]
    pub fn next_local_ino(&self) -> u64 {
        *self.next_local_ino.lock()
    }

    pub fn set_next_local_ino(&self, value: u64) -> Result<()> {
        let mut current = self.next_local_ino.lock();
        self.write_field_u64(BranchRecord::NEXT_LOCAL_INO_FIELD, value)?;
        *current = value;
        Ok(())
    }

    /// Overwrite the whole slot with a zeroed record, returning it to the
    /// FREE pool. The log bytes in the delta region are lost space.
    pub fn clear_slot(&self) -> Result<()> {
        self.window
            .write_all_at(self.slot_offset, &vec![0_u8; forkfs_types::BRANCH_RECORD_SIZE])
    }

    fn write_field_u32(&self, field: u64, value: u32) -> Result<()> {
        let offset = self
            .slot_offset
            .checked_add(field)
            .ok_or(ForkFsError::Invalid("branch field offset overflows u64"))?;
        self.window.write_all_at(offset, &value.to_le_bytes())
    }

    fn write_field_u64(&self, field: u64, value: u64) -> Result<()> {
        let offset = self
            .slot_offset
            .checked_add(field)
            .ok_or(ForkFsError::Invalid("branch field offset overflows u64"))?;
        self.window.write_all_at(offset, &value.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkfs_ondisk::format::{FormatOptions, format_image};
    use forkfs_window::MemWindow;

    fn main_ctx() -> (Arc<MemWindow>, BranchCtx) {
        let window = Arc::new(MemWindow::zeroed(2 * 1024 * 1024));
        let sb = format_image(
            window.as_ref(),
            &FormatOptions {
                base_image: None,
                main_log_capacity: 8192,
            },
        )
        .expect("format");
        let slot = sb.branch_slot_offset(0).unwrap();
        let mut record = vec![0_u8; forkfs_types::BRANCH_RECORD_SIZE];
        window.read_exact_at(slot, &mut record).expect("read");
        let record = BranchRecord::parse(&record).expect("parse");
        let ctx = BranchCtx::from_record(window.clone(), &sb, 0, &record).expect("ctx");
        (window, ctx)
    }

    fn reread_record(window: &MemWindow, ctx: &BranchCtx) -> BranchRecord {
        let mut raw = vec![0_u8; forkfs_types::BRANCH_RECORD_SIZE];
        window.read_exact_at(ctx.slot_offset, &mut raw).expect("read");
        BranchRecord::parse(&raw).expect("parse")
    }

    #[test]
    fn state_changes_persist() {
        let (window, ctx) = main_ctx();
        assert_eq!(ctx.state(), BranchState::Active);
        ctx.set_state(BranchState::Committed).expect("commit state");
        assert_eq!(ctx.state(), BranchState::Committed);
        assert_eq!(reread_record(&window, &ctx).state, BranchState::Committed);
        // Terminal states stay terminal.
        assert!(ctx.set_state(BranchState::Active).is_err());
    }

    #[test]
    fn refcount_round_trips_through_storage() {
        let (window, ctx) = main_ctx();
        assert_eq!(ctx.refcount(), 1);
        ctx.refcount_inc().expect("inc");
        ctx.refcount_inc().expect("inc");
        assert_eq!(reread_record(&window, &ctx).refcount, 3);
        ctx.refcount_dec().expect("dec");
        assert_eq!(ctx.refcount(), 2);
    }

    #[test]
    fn staleness_is_one_way() {
        let (_window, ctx) = main_ctx();
        assert!(!ctx.is_stale());
        ctx.invalidate();
        ctx.invalidate();
        assert!(ctx.is_stale());
    }

    #[test]
    fn clear_slot_frees_the_record() {
        let (window, ctx) = main_ctx();
        ctx.set_state(BranchState::Aborted).expect("abort");
        ctx.clear_slot().expect("clear");
        let record = reread_record(&window, &ctx);
        assert_eq!(record.state, BranchState::Free);
        assert_eq!(record.branch_id.0, 0);
    }
}
