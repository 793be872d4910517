//! Delta-region bump allocator.
//!
//! One monotone bump pointer over the shared delta region, persisted in the
//! superblock's `delta_alloc_offset` field. Branches reserve contiguous
//! sub-ranges here at fork time and then bump within their own range. Space
//! handed out is never reclaimed; an aborted branch's bytes are lost space.

use forkfs_error::{ForkFsError, Result};
use forkfs_ondisk::Superblock;
use forkfs_types::ByteOffset;
use forkfs_window::Window;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

struct AllocState {
    bump: u64,
    region_end: u64,
}

/// Super-level allocator over the delta region.
pub struct RegionAllocator {
    window: Arc<dyn Window>,
    inner: Mutex<AllocState>,
}

impl RegionAllocator {
    /// Resume the allocator from superblock state.
    #[must_use]
    pub fn new(window: Arc<dyn Window>, sb: &Superblock) -> Self {
        Self {
            window,
            inner: Mutex::new(AllocState {
                bump: sb.delta_alloc_offset,
                region_end: sb.delta_region_end(),
            }),
        }
    }

    /// Reserve `size` contiguous bytes; returns the sub-range's start.
    ///
    /// The persisted counter is advanced before the in-memory bump so a
    /// failed write leaves the allocator unchanged.
    pub fn reserve(&self, size: u64) -> Result<ByteOffset> {
        let mut state = self.inner.lock();
        let offset = state.bump;
        let end = offset
            .checked_add(size)
            .ok_or(ForkFsError::Invalid("reservation overflows u64"))?;
        if end > state.region_end {
            warn!(
                target: "forkfs::alloc",
                requested = size,
                bump = offset,
                region_end = state.region_end,
                "delta region exhausted"
            );
            return Err(ForkFsError::NoSpace);
        }

        self.window.write_all_at(
            ByteOffset(Superblock::DELTA_ALLOC_FIELD),
            &end.to_le_bytes(),
        )?;
        state.bump = end;
        debug!(target: "forkfs::alloc", offset, size, "reserved delta sub-range");
        Ok(ByteOffset(offset))
    }

    /// Current bump position.
    #[must_use]
    pub fn bump(&self) -> u64 {
        self.inner.lock().bump
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkfs_ondisk::format::{FormatOptions, format_image};
    use forkfs_types::read_le_u64;
    use forkfs_window::MemWindow;

    fn formatted() -> (Arc<MemWindow>, Superblock) {
        let window = Arc::new(MemWindow::zeroed(2 * 1024 * 1024));
        let sb = format_image(
            window.as_ref(),
            &FormatOptions {
                base_image: None,
                main_log_capacity: 8192,
            },
        )
        .expect("format");
        (window, sb)
    }

    #[test]
    fn reserve_advances_and_persists() {
        let (window, sb) = formatted();
        let alloc = RegionAllocator::new(window.clone(), &sb);

        let first = alloc.reserve(4096).expect("first");
        assert_eq!(first.0, sb.delta_alloc_offset);
        let second = alloc.reserve(4096).expect("second");
        assert_eq!(second.0, sb.delta_alloc_offset + 4096);

        let snap = window.snapshot();
        let persisted = read_le_u64(
            &snap,
            usize::try_from(Superblock::DELTA_ALLOC_FIELD).unwrap(),
        )
        .unwrap();
        assert_eq!(persisted, alloc.bump());
    }

    #[test]
    fn reserve_fails_past_region_end() {
        let (window, sb) = formatted();
        let alloc = RegionAllocator::new(window, &sb);
        let remaining = sb.delta_region_end() - sb.delta_alloc_offset;
        assert!(alloc.reserve(remaining + 1).is_err());
        // Exact fit still succeeds, then the region is full.
        alloc.reserve(remaining).expect("exact fit");
        assert!(matches!(alloc.reserve(1), Err(ForkFsError::NoSpace)));
    }
}
