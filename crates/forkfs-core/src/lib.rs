#![forbid(unsafe_code)]
//! ForkFS engine.
//!
//! [`ForkFs`] ties the pieces together: the storage window, the superblock,
//! the delta-region allocator, the branch table, the optional base image,
//! and the mount table. Branch lifecycle (fork, commit, abort, sibling
//! invalidation) lives here; the VFS operation handlers are in [`ops`].

pub mod branch;
pub mod ops;
pub mod resolve;

pub use ops::{RENAME_NOREPLACE, SetAttrRequest};
pub use resolve::{DirEntry, ResolvedInode};

use branch::BranchCtx;
use forkfs_delta::RegionAllocator;
use forkfs_error::{ForkFsError, Result};
use forkfs_ondisk::base::BaseImage;
use forkfs_ondisk::{BranchRecord, BranchState, MAIN_BRANCH, Superblock, parse_branch_table};
use forkfs_types::{
    BRANCH_NAME_MAX, BRANCH_RECORD_SIZE, BranchId, ByteOffset, InodeNumber, MountId,
    SUPERBLOCK_SIZE, u64_to_usize,
};
use forkfs_window::Window;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct ForkFsOptions {
    /// Delta log capacity reserved for each new branch at fork time.
    pub branch_capacity: u64,
}

impl Default for ForkFsOptions {
    fn default() -> Self {
        Self {
            branch_capacity: forkfs_ondisk::format::DEFAULT_BRANCH_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Mount {
    branch: BranchId,
    read_only: bool,
}

/// Branch summary for management tools.
#[derive(Debug, Clone, Serialize)]
pub struct BranchInfo {
    pub name: String,
    pub id: u64,
    pub parent_id: u64,
    pub state: BranchState,
    pub stale: bool,
    pub refcount: u32,
    pub log_used: u64,
    pub log_capacity: u64,
}

/// A mounted ForkFS image.
pub struct ForkFs {
    window: Arc<dyn Window>,
    opts: ForkFsOptions,
    sb: Mutex<Superblock>,
    alloc: RegionAllocator,
    base: Option<BaseImage>,
    branches: RwLock<BTreeMap<BranchId, Arc<BranchCtx>>>,
    /// Which branch table slots are occupied, index-aligned with the table.
    slots: Mutex<Vec<bool>>,
    mounts: Mutex<BTreeMap<MountId, Mount>>,
    next_mount_id: AtomicU64,
}

impl ForkFs {
    /// Open a formatted image inside `window`: parse the superblock and the
    /// branch table, rebuild every ACTIVE branch's indices, and attach the
    /// base image if one is embedded.
    ///
    /// A branch whose log fails index rebuild is marked ABORTED; the rest
    /// of the filesystem stays usable.
    pub fn open(window: Arc<dyn Window>, opts: ForkFsOptions) -> Result<Self> {
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        window.read_exact_at(ByteOffset::ZERO, &mut region)?;
        let sb = Superblock::parse(&region)?;

        let base = if sb.base_offset != 0 {
            Some(BaseImage::open(
                Arc::clone(&window),
                ByteOffset(sb.base_offset),
            )?)
        } else {
            None
        };

        let table_len = u64_to_usize(
            u64::from(sb.branch_table_entries)
                * u64::try_from(BRANCH_RECORD_SIZE)
                    .map_err(|_| ForkFsError::Invalid("record size overflows u64"))?,
            "branch_table",
        )?;
        let mut table = vec![0_u8; table_len];
        window.read_exact_at(ByteOffset(sb.branch_table_offset), &mut table)?;
        let records = parse_branch_table(&table, sb.branch_table_entries)?;

        let mut branches = BTreeMap::new();
        let mut slots = vec![false; records.len()];
        for (slot, record) in records.iter().enumerate() {
            if !record.is_in_use() {
                continue;
            }
            let slot_u32 = forkfs_types::usize_to_u32(slot, "branch_slot")?;
            let ctx = BranchCtx::from_record(Arc::clone(&window), &sb, slot_u32, record)?;
            if ctx.state() == BranchState::Active
                && let Err(err) = ctx.log.build_index()
            {
                error!(
                    target: "forkfs::branch",
                    branch = %ctx.name,
                    error = %err,
                    "index rebuild failed; aborting branch"
                );
                ctx.set_state(BranchState::Aborted)?;
                ctx.invalidate();
            }
            slots[slot] = true;
            branches.insert(ctx.id, Arc::new(ctx));
        }

        info!(
            target: "forkfs::core",
            branches = branches.len(),
            base = base.is_some(),
            "filesystem opened"
        );

        let alloc = RegionAllocator::new(Arc::clone(&window), &sb);
        Ok(Self {
            window,
            opts,
            sb: Mutex::new(sb),
            alloc,
            base,
            branches: RwLock::new(branches),
            slots: Mutex::new(slots),
            mounts: Mutex::new(BTreeMap::new()),
            next_mount_id: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn base(&self) -> Option<&BaseImage> {
        self.base.as_ref()
    }

    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.sb.lock().clone()
    }

    // ── Branch lifecycle ────────────────────────────────────────────────

    /// Fork a new ACTIVE branch from `parent_name`.
    pub fn create_branch(&self, name: &str, parent_name: &str) -> Result<BranchId> {
        validate_branch_name(name)?;

        let mut branches = self.branches.write();
        if branches.values().any(|b| b.name == name) {
            return Err(ForkFsError::Exists);
        }
        let parent = branches
            .values()
            .find(|b| b.name == parent_name)
            .cloned()
            .ok_or_else(|| ForkFsError::NotFound(format!("branch '{parent_name}'")))?;
        if parent.state() != BranchState::Active || parent.is_stale() {
            return Err(ForkFsError::Stale);
        }

        let mut slots = self.slots.lock();
        let slot = slots
            .iter()
            .position(|used| !used)
            .ok_or(ForkFsError::NoSpace)?;
        let slot_u32 = forkfs_types::usize_to_u32(slot, "branch_slot")?;

        let capacity = self.opts.branch_capacity;
        let log_offset = self.alloc.reserve(capacity)?;

        let (id, next_local_ino, sb_snapshot) = {
            let mut sb = self.sb.lock();
            let id = BranchId(sb.next_branch_id);
            sb.next_branch_id += 1;
            sb.active_branches += 1;
            self.persist_u64(Superblock::NEXT_BRANCH_ID_FIELD, sb.next_branch_id)?;
            self.persist_u32(Superblock::ACTIVE_BRANCHES_FIELD, sb.active_branches)?;
            (id, sb.next_inode_id, sb.clone())
        };

        let record = BranchRecord {
            branch_id: id,
            parent_id: parent.id,
            delta_log_offset: log_offset.0,
            delta_log_size: 0,
            delta_log_capacity: capacity,
            state: BranchState::Active,
            refcount: 1,
            next_local_ino,
            name: name.to_owned(),
        };
        self.window.write_all_at(
            sb_snapshot.branch_slot_offset(slot_u32)?,
            &record.encode()?,
        )?;
        parent.refcount_inc()?;

        let ctx = Arc::new(BranchCtx::from_record(
            Arc::clone(&self.window),
            &sb_snapshot,
            slot_u32,
            &record,
        )?);
        slots[slot] = true;
        drop(slots);

        info!(
            target: "forkfs::branch",
            branch = name,
            id = id.0,
            parent = %parent.name,
            capacity,
            "branch forked"
        );

        branches.insert(id, ctx);
        Ok(id)
    }

    /// Merge `name`'s delta log into its parent, invalidating siblings.
    pub fn commit(&self, name: &str) -> Result<()> {
        let branches = self.branches.write();
        let child = branches
            .values()
            .find(|b| b.name == name)
            .cloned()
            .ok_or_else(|| ForkFsError::NotFound(format!("branch '{name}'")))?;
        if child.state() != BranchState::Active || child.is_stale() {
            return Err(ForkFsError::Stale);
        }
        if child.parent_id == BranchId::NONE {
            return Err(ForkFsError::Invalid("main branch has no parent to commit into"));
        }
        let parent = branches
            .get(&child.parent_id)
            .cloned()
            .ok_or_else(|| ForkFsError::Corruption {
                offset: 0,
                detail: format!("branch '{name}' references missing parent"),
            })?;
        if parent.state() != BranchState::Active || parent.is_stale() {
            return Err(ForkFsError::Stale);
        }

        let child_bytes = child.log.read_log()?;
        if parent.log.used() + child.log.used() > parent.log.capacity() {
            warn!(
                target: "forkfs::branch",
                branch = name,
                parent = %parent.name,
                child_size = child.log.used(),
                parent_used = parent.log.used(),
                parent_capacity = parent.log.capacity(),
                "parent delta log too small for merge"
            );
            return Err(ForkFsError::NoSpace);
        }

        if !child_bytes.is_empty() {
            parent.log.append_raw(&child_bytes)?;
        }
        if let Err(err) = parent.log.build_index() {
            error!(
                target: "forkfs::branch",
                parent = %parent.name,
                error = %err,
                "index rebuild failed after merge; aborting parent"
            );
            parent.set_state(BranchState::Aborted)?;
            parent.invalidate();
            return Err(err);
        }

        child.set_state(BranchState::Committed)?;
        child.log.drop_indexes();
        child.refcount_dec()?;
        parent.refcount_dec()?;
        {
            let mut sb = self.sb.lock();
            sb.active_branches = sb.active_branches.saturating_sub(1);
            self.persist_u32(Superblock::ACTIVE_BRANCHES_FIELD, sb.active_branches)?;
        }

        // The commit changed the parent's visible state; every other
        // ACTIVE child of the same parent inherited assumptions that no
        // longer hold.
        for sibling in branches.values() {
            if sibling.id != child.id
                && sibling.parent_id == child.parent_id
                && sibling.state() == BranchState::Active
            {
                sibling.invalidate();
            }
        }

        info!(
            target: "forkfs::branch",
            branch = name,
            parent = %parent.name,
            merged_bytes = child_bytes.len(),
            "branch committed"
        );

        drop(branches);
        self.release_if_unreferenced(&child)?;
        Ok(())
    }

    /// Abort `name`, discarding its mutations. Works on invalidated
    /// branches too; aborting is how a stale branch is cleaned up.
    pub fn abort(&self, name: &str) -> Result<()> {
        let branches = self.branches.write();
        let child = branches
            .values()
            .find(|b| b.name == name)
            .cloned()
            .ok_or_else(|| ForkFsError::NotFound(format!("branch '{name}'")))?;
        if child.state() != BranchState::Active {
            return Err(ForkFsError::Stale);
        }

        child.set_state(BranchState::Aborted)?;
        child.log.drop_indexes();
        child.refcount_dec()?;
        if child.parent_id != BranchId::NONE
            && let Some(parent) = branches.get(&child.parent_id)
        {
            parent.refcount_dec()?;
        }
        {
            let mut sb = self.sb.lock();
            sb.active_branches = sb.active_branches.saturating_sub(1);
            self.persist_u32(Superblock::ACTIVE_BRANCHES_FIELD, sb.active_branches)?;
        }

        info!(target: "forkfs::branch", branch = name, "branch aborted");

        drop(branches);
        self.release_if_unreferenced(&child)?;
        Ok(())
    }

    /// Consistency scan: every branch's records must sum exactly to its
    /// published `delta_log_size`. Returns the findings (empty = healthy).
    pub fn verify(&self) -> Result<Vec<String>> {
        let mut findings = Vec::new();
        for branch in self.branches.read().values() {
            match branch.log.scan_total() {
                Ok(total) if total == branch.log.used() => {}
                Ok(total) => findings.push(format!(
                    "branch '{}': records sum to {total} bytes but delta_log_size is {}",
                    branch.name,
                    branch.log.used()
                )),
                Err(err) => findings.push(format!("branch '{}': {err}", branch.name)),
            }
        }
        Ok(findings)
    }

    /// Summaries of every branch record in use.
    #[must_use]
    pub fn branches_info(&self) -> Vec<BranchInfo> {
        self.branches
            .read()
            .values()
            .map(|b| BranchInfo {
                name: b.name.clone(),
                id: b.id.0,
                parent_id: b.parent_id.0,
                state: b.state(),
                stale: b.is_stale(),
                refcount: b.refcount(),
                log_used: b.log.used(),
                log_capacity: b.log.capacity(),
            })
            .collect()
    }

    // ── Mount table ─────────────────────────────────────────────────────

    /// Bind a read-write mount to an ACTIVE branch.
    pub fn mount(&self, name: &str) -> Result<MountId> {
        self.mount_inner(name, false)
    }

    /// Bind a read-only mount (e.g. inspecting `main` or a base-only view).
    pub fn mount_read_only(&self, name: &str) -> Result<MountId> {
        self.mount_inner(name, true)
    }

    fn mount_inner(&self, name: &str, read_only: bool) -> Result<MountId> {
        let branches = self.branches.read();
        let branch = branches
            .values()
            .find(|b| b.name == name)
            .ok_or_else(|| ForkFsError::NotFound(format!("branch '{name}'")))?;
        if branch.state() != BranchState::Active || branch.is_stale() {
            return Err(ForkFsError::Stale);
        }
        branch.refcount_inc()?;
        let id = MountId(self.next_mount_id.fetch_add(1, Ordering::Relaxed));
        self.mounts.lock().insert(
            id,
            Mount {
                branch: branch.id,
                read_only,
            },
        );
        Ok(id)
    }

    /// Release a mount and its refcount on the bound branch.
    pub fn unmount(&self, mount: MountId) -> Result<()> {
        let entry = self
            .mounts
            .lock()
            .remove(&mount)
            .ok_or_else(|| ForkFsError::NotFound(format!("mount {mount}")))?;
        let branch = self.branches.read().get(&entry.branch).cloned();
        if let Some(branch) = branch {
            branch.refcount_dec()?;
            self.release_if_unreferenced(&branch)?;
        }
        Ok(())
    }

    /// Convenience: mount the `main` branch read-only.
    pub fn mount_main_read_only(&self) -> Result<MountId> {
        self.mount_read_only(MAIN_BRANCH)
    }

    // ── Internals shared with ops ───────────────────────────────────────

    pub(crate) fn writable_chain(&self, mount: MountId) -> Result<Vec<Arc<BranchCtx>>> {
        let (chain, read_only) = self.mount_chain(mount)?;
        if read_only {
            return Err(ForkFsError::ReadOnly);
        }
        Ok(chain)
    }

    pub(crate) fn readable_chain(&self, mount: MountId) -> Result<Vec<Arc<BranchCtx>>> {
        Ok(self.mount_chain(mount)?.0)
    }

    /// Leaf-to-root branch chain for a mount, verifying no link is stale.
    fn mount_chain(&self, mount: MountId) -> Result<(Vec<Arc<BranchCtx>>, bool)> {
        let entry = *self
            .mounts
            .lock()
            .get(&mount)
            .ok_or_else(|| ForkFsError::NotFound(format!("mount {mount}")))?;
        let branches = self.branches.read();
        let mut chain = Vec::new();
        let mut cursor = Some(entry.branch);
        while let Some(id) = cursor {
            let ctx = branches.get(&id).ok_or_else(|| ForkFsError::Corruption {
                offset: 0,
                detail: format!("branch chain references missing branch {id}"),
            })?;
            if ctx.is_stale() {
                return Err(ForkFsError::Stale);
            }
            chain.push(Arc::clone(ctx));
            cursor = (ctx.parent_id != BranchId::NONE).then_some(ctx.parent_id);
        }
        // The leaf must still accept operations; terminal states (and the
        // aborted-on-corruption case) surface as STALE.
        if chain[0].state() != BranchState::Active {
            return Err(ForkFsError::Stale);
        }
        Ok((chain, entry.read_only))
    }

    /// Allocate a fresh inode number: branch-local counter and the global
    /// bound advance together, so ids never collide across branches.
    pub(crate) fn alloc_ino(&self, branch: &BranchCtx) -> Result<InodeNumber> {
        let mut sb = self.sb.lock();
        let ino = sb.next_inode_id.max(branch.next_local_ino());
        sb.next_inode_id = ino + 1;
        self.persist_u64(Superblock::NEXT_INODE_ID_FIELD, sb.next_inode_id)?;
        branch.set_next_local_ino(ino + 1)?;
        Ok(InodeNumber(ino))
    }

    fn persist_u64(&self, field: u64, value: u64) -> Result<()> {
        self.window
            .write_all_at(ByteOffset(field), &value.to_le_bytes())
    }

    fn persist_u32(&self, field: u64, value: u32) -> Result<()> {
        self.window
            .write_all_at(ByteOffset(field), &value.to_le_bytes())
    }

    pub(crate) fn window(&self) -> &Arc<dyn Window> {
        &self.window
    }

    /// Free a terminal branch's slot once nothing references it.
    fn release_if_unreferenced(&self, branch: &BranchCtx) -> Result<()> {
        if !branch.state().is_terminal() || branch.refcount() > 0 {
            return Ok(());
        }
        branch.clear_slot()?;
        self.branches.write().remove(&branch.id);
        if let Some(slot) = self.slots.lock().get_mut(u64_to_usize(
            u64::from(branch.slot),
            "branch_slot",
        )?) {
            *slot = false;
        }
        info!(
            target: "forkfs::branch",
            branch = %branch.name,
            slot = branch.slot,
            "branch slot reclaimed"
        );
        Ok(())
    }
}

fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ForkFsError::Invalid("branch name must not be empty"));
    }
    if name.len() > BRANCH_NAME_MAX {
        return Err(ForkFsError::NameTooLong);
    }
    if name.contains(['/', '\0']) {
        return Err(ForkFsError::Invalid("branch name contains reserved bytes"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkfs_ondisk::format::{FormatOptions, format_image};
    use forkfs_window::MemWindow;

    fn open_fresh() -> ForkFs {
        let window = Arc::new(MemWindow::zeroed(8 * 1024 * 1024));
        format_image(
            window.as_ref(),
            &FormatOptions {
                base_image: None,
                main_log_capacity: 256 * 1024,
            },
        )
        .expect("format");
        ForkFs::open(
            window,
            ForkFsOptions {
                branch_capacity: 64 * 1024,
            },
        )
        .expect("open")
    }

    #[test]
    fn open_exposes_main_branch() {
        let fs = open_fresh();
        let info = fs.branches_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].name, MAIN_BRANCH);
        assert_eq!(info[0].state, BranchState::Active);
        assert_eq!(info[0].refcount, 1);
    }

    #[test]
    fn fork_creates_active_child_and_bumps_parent_refcount() {
        let fs = open_fresh();
        fs.create_branch("b1", MAIN_BRANCH).expect("fork");
        let info = fs.branches_info();
        assert_eq!(info.len(), 2);
        let main = info.iter().find(|b| b.name == MAIN_BRANCH).unwrap();
        let child = info.iter().find(|b| b.name == "b1").unwrap();
        assert_eq!(main.refcount, 2);
        assert_eq!(child.refcount, 1);
        assert_eq!(child.parent_id, main.id);
        assert_eq!(child.state, BranchState::Active);
    }

    #[test]
    fn fork_validates_names() {
        let fs = open_fresh();
        assert!(matches!(
            fs.create_branch("", MAIN_BRANCH),
            Err(ForkFsError::Invalid(_))
        ));
        assert!(matches!(
            fs.create_branch(&"x".repeat(40), MAIN_BRANCH),
            Err(ForkFsError::NameTooLong)
        ));
        fs.create_branch("dup", MAIN_BRANCH).expect("first");
        assert!(matches!(
            fs.create_branch("dup", MAIN_BRANCH),
            Err(ForkFsError::Exists)
        ));
        assert!(matches!(
            fs.create_branch("ok", "missing"),
            Err(ForkFsError::NotFound(_))
        ));
    }

    #[test]
    fn abort_reclaims_slot_and_parent_refcount() {
        let fs = open_fresh();
        fs.create_branch("doomed", MAIN_BRANCH).expect("fork");
        fs.abort("doomed").expect("abort");
        let info = fs.branches_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].refcount, 1);
        // The freed slot is reusable.
        fs.create_branch("reborn", MAIN_BRANCH).expect("reuse slot");
    }

    #[test]
    fn commit_invalidates_siblings_but_not_the_parent() {
        let fs = open_fresh();
        fs.create_branch("b1", MAIN_BRANCH).expect("b1");
        fs.create_branch("b2", MAIN_BRANCH).expect("b2");
        fs.commit("b1").expect("commit");

        let info = fs.branches_info();
        let main = info.iter().find(|b| b.name == MAIN_BRANCH).unwrap();
        let b2 = info.iter().find(|b| b.name == "b2").unwrap();
        assert!(!main.stale);
        assert!(b2.stale);
        assert_eq!(b2.state, BranchState::Active);

        // Invalidated branches cannot commit, but can be aborted.
        assert!(matches!(fs.commit("b2"), Err(ForkFsError::Stale)));
        fs.abort("b2").expect("abort stale sibling");
    }

    #[test]
    fn main_cannot_commit_or_be_reforked_under_same_name() {
        let fs = open_fresh();
        assert!(matches!(
            fs.commit(MAIN_BRANCH),
            Err(ForkFsError::Invalid(_))
        ));
        assert!(matches!(
            fs.create_branch(MAIN_BRANCH, MAIN_BRANCH),
            Err(ForkFsError::Exists)
        ));
    }

    #[test]
    fn mounts_pin_branch_records() {
        let fs = open_fresh();
        fs.create_branch("b1", MAIN_BRANCH).expect("fork");
        let mount = fs.mount("b1").expect("mount");
        fs.abort("b1").expect("abort");
        // Aborted but still mounted: record stays.
        assert!(fs.branches_info().iter().any(|b| b.name == "b1"));
        fs.unmount(mount).expect("unmount");
        assert!(!fs.branches_info().iter().any(|b| b.name == "b1"));
    }

    #[test]
    fn mount_of_unknown_branch_fails() {
        let fs = open_fresh();
        assert!(matches!(fs.mount("nope"), Err(ForkFsError::NotFound(_))));
        assert!(matches!(
            fs.unmount(MountId(99)),
            Err(ForkFsError::NotFound(_))
        ));
    }
}
