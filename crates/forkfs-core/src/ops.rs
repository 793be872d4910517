//! VFS operation handlers.
//!
//! Every mutation lands in the current mount's branch log, never in an
//! ancestor or the base image. Handlers validate first, compute the record,
//! append (which updates the indices atomically with publication), and then
//! report the VFS-visible result.

use crate::resolve::{self, DirEntry, ResolvedInode};
use crate::{ForkFs, branch::BranchCtx};
use forkfs_error::{ForkFsError, Result};
use forkfs_ondisk::record::{ATTR_GID, ATTR_MODE, ATTR_UID, DeltaRecord};
use forkfs_types::{InodeNumber, MountId, S_IFDIR, S_IFREG, is_dir, is_reg, u64_to_usize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Only flag accepted by [`ForkFs::rename`].
pub const RENAME_NOREPLACE: u32 = 1;

/// Longest file name accepted by the write path.
const NAME_MAX: usize = 255;

/// Attribute updates for [`ForkFs::setattr`]; `None` fields are untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name == b"." || name == b".." {
        return Err(ForkFsError::Invalid("reserved entry name"));
    }
    if name.len() > NAME_MAX {
        return Err(ForkFsError::NameTooLong);
    }
    if name.contains(&b'/') || name.contains(&0) {
        return Err(ForkFsError::Invalid("entry name contains reserved bytes"));
    }
    Ok(())
}

impl ForkFs {
    // ── Name operations ─────────────────────────────────────────────────

    /// Resolve `name` under `parent`; `None` is a negative lookup.
    pub fn lookup(
        &self,
        mount: MountId,
        parent: InodeNumber,
        name: &[u8],
    ) -> Result<Option<InodeNumber>> {
        let chain = self.readable_chain(mount)?;
        resolve::resolve_dirent(&chain, self.base(), parent, name)
    }

    pub fn getattr(&self, mount: MountId, ino: InodeNumber) -> Result<ResolvedInode> {
        let chain = self.readable_chain(mount)?;
        resolve::resolve_inode(&chain, self.base(), ino)?
            .ok_or_else(|| ForkFsError::NotFound(format!("inode {ino}")))
    }

    pub fn setattr(
        &self,
        mount: MountId,
        ino: InodeNumber,
        request: SetAttrRequest,
    ) -> Result<ResolvedInode> {
        let chain = self.writable_chain(mount)?;
        if resolve::resolve_inode(&chain, self.base(), ino)?.is_none() {
            return Err(ForkFsError::NotFound(format!("inode {ino}")));
        }
        let branch = &chain[0];

        if let Some(size) = request.size {
            branch
                .log
                .append(&DeltaRecord::Truncate { new_size: size }, ino, now_nanos())?;
        }

        let mut valid = 0;
        if request.mode.is_some() {
            valid |= ATTR_MODE;
        }
        if request.uid.is_some() {
            valid |= ATTR_UID;
        }
        if request.gid.is_some() {
            valid |= ATTR_GID;
        }
        if valid != 0 {
            branch.log.append(
                &DeltaRecord::SetAttr {
                    mode: request.mode.unwrap_or(0),
                    uid: request.uid.unwrap_or(0),
                    gid: request.gid.unwrap_or(0),
                    valid,
                    size: 0,
                },
                ino,
                now_nanos(),
            )?;
        }

        resolve::resolve_inode(&chain, self.base(), ino)?
            .ok_or_else(|| ForkFsError::NotFound(format!("inode {ino}")))
    }

    pub fn create(
        &self,
        mount: MountId,
        parent: InodeNumber,
        name: &[u8],
        mode: u32,
    ) -> Result<InodeNumber> {
        self.create_entry(mount, parent, name, S_IFREG | (mode & 0o7777), false)
    }

    pub fn mkdir(
        &self,
        mount: MountId,
        parent: InodeNumber,
        name: &[u8],
        mode: u32,
    ) -> Result<InodeNumber> {
        self.create_entry(mount, parent, name, S_IFDIR | (mode & 0o7777), true)
    }

    fn create_entry(
        &self,
        mount: MountId,
        parent: InodeNumber,
        name: &[u8],
        mode: u32,
        directory: bool,
    ) -> Result<InodeNumber> {
        validate_name(name)?;
        let chain = self.writable_chain(mount)?;
        self.require_dir(&chain, parent)?;
        if resolve::resolve_dirent(&chain, self.base(), parent, name)?.is_some() {
            return Err(ForkFsError::Exists);
        }

        let branch = &chain[0];
        let new_ino = self.alloc_ino(branch)?;
        let record = if directory {
            DeltaRecord::Mkdir {
                parent,
                new_ino,
                mode,
                flags: 0,
                name,
            }
        } else {
            DeltaRecord::Create {
                parent,
                new_ino,
                mode,
                flags: 0,
                name,
            }
        };
        branch.log.append(&record, new_ino, now_nanos())?;
        debug!(
            target: "forkfs::ops",
            parent = parent.0,
            ino = new_ino.0,
            directory,
            "entry created"
        );
        Ok(new_ino)
    }

    pub fn unlink(&self, mount: MountId, parent: InodeNumber, name: &[u8]) -> Result<()> {
        let chain = self.writable_chain(mount)?;
        let target = self.require_entry(&chain, parent, name)?;
        if is_dir(target.mode) {
            return Err(ForkFsError::IsDirectory);
        }
        self.append_tombstone(&chain[0], parent, name, target.ino)
    }

    pub fn rmdir(&self, mount: MountId, parent: InodeNumber, name: &[u8]) -> Result<()> {
        let chain = self.writable_chain(mount)?;
        let target = self.require_entry(&chain, parent, name)?;
        if !is_dir(target.mode) {
            return Err(ForkFsError::NotDirectory);
        }
        if !resolve::dir_is_empty(&chain, self.base(), target.ino)? {
            return Err(ForkFsError::NotEmpty);
        }
        self.append_tombstone(&chain[0], parent, name, target.ino)
    }

    fn append_tombstone(
        &self,
        branch: &Arc<BranchCtx>,
        parent: InodeNumber,
        name: &[u8],
        ino: InodeNumber,
    ) -> Result<()> {
        branch.log.append(
            &DeltaRecord::Delete {
                parent,
                flags: 0,
                name,
            },
            ino,
            now_nanos(),
        )?;
        debug!(target: "forkfs::ops", parent = parent.0, ino = ino.0, "tombstone appended");
        Ok(())
    }

    /// Rename `old_parent/old_name` to `new_parent/new_name`. Only
    /// `RENAME_NOREPLACE` is supported; an existing target without it is
    /// unsupported and rejected as invalid.
    pub fn rename(
        &self,
        mount: MountId,
        old_parent: InodeNumber,
        old_name: &[u8],
        new_parent: InodeNumber,
        new_name: &[u8],
        flags: u32,
    ) -> Result<()> {
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(ForkFsError::Invalid("unsupported rename flags"));
        }
        validate_name(new_name)?;
        let chain = self.writable_chain(mount)?;
        let source = self.require_entry(&chain, old_parent, old_name)?;
        self.require_dir(&chain, new_parent)?;
        if resolve::resolve_dirent(&chain, self.base(), new_parent, new_name)?.is_some() {
            return if flags & RENAME_NOREPLACE != 0 {
                Err(ForkFsError::Exists)
            } else {
                Err(ForkFsError::Invalid("rename target exists"))
            };
        }

        chain[0].log.append(
            &DeltaRecord::Rename {
                old_parent,
                new_parent,
                ino: source.ino,
                old_name,
                new_name,
            },
            source.ino,
            now_nanos(),
        )?;
        Ok(())
    }

    // ── File data ───────────────────────────────────────────────────────

    /// Read up to `len` bytes from `pos`. Returns the available prefix;
    /// holes and EOF end the read short, as the chunked resolve loop of the
    /// read path dictates.
    pub fn read(&self, mount: MountId, ino: InodeNumber, pos: u64, len: usize) -> Result<Vec<u8>> {
        let chain = self.readable_chain(mount)?;
        let inode = resolve::resolve_inode(&chain, self.base(), ino)?
            .ok_or_else(|| ForkFsError::NotFound(format!("inode {ino}")))?;
        if is_dir(inode.mode) {
            return Err(ForkFsError::IsDirectory);
        }
        if pos >= inode.size {
            return Ok(Vec::new());
        }

        let want = u64::try_from(len)
            .map_err(|_| ForkFsError::Invalid("read length overflows u64"))?
            .min(inode.size - pos);
        let mut out = Vec::with_capacity(u64_to_usize(want, "read_len")?);
        let mut got = 0_u64;
        while got < want {
            let Some(chunk) = resolve::resolve_data(&chain, self.base(), ino, pos + got)? else {
                break;
            };
            let take = chunk.avail.min(want - got);
            let mut buf = vec![0_u8; u64_to_usize(take, "read_chunk")?];
            self.window().read_exact_at(chunk.data_offset, &mut buf)?;
            out.extend_from_slice(&buf);
            got += take;
        }
        Ok(out)
    }

    /// Append one WRITE record carrying `data` at `pos`.
    pub fn write(&self, mount: MountId, ino: InodeNumber, pos: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let chain = self.writable_chain(mount)?;
        let inode = resolve::resolve_inode(&chain, self.base(), ino)?
            .ok_or_else(|| ForkFsError::NotFound(format!("inode {ino}")))?;
        if !is_reg(inode.mode) {
            return Err(ForkFsError::IsDirectory);
        }
        pos.checked_add(
            u64::try_from(data.len())
                .map_err(|_| ForkFsError::Invalid("write length overflows u64"))?,
        )
        .ok_or(ForkFsError::Invalid("write range overflows u64"))?;

        chain[0].log.append(
            &DeltaRecord::Write {
                offset: pos,
                flags: 0,
                data,
            },
            ino,
            now_nanos(),
        )?;
        Ok(data.len())
    }

    pub fn truncate(&self, mount: MountId, ino: InodeNumber, size: u64) -> Result<()> {
        let chain = self.writable_chain(mount)?;
        let inode = resolve::resolve_inode(&chain, self.base(), ino)?
            .ok_or_else(|| ForkFsError::NotFound(format!("inode {ino}")))?;
        if is_dir(inode.mode) {
            return Err(ForkFsError::IsDirectory);
        }
        chain[0]
            .log
            .append(&DeltaRecord::Truncate { new_size: size }, ino, now_nanos())?;
        Ok(())
    }

    /// Enumerate `dir` starting at `cursor` entries in (0 includes the
    /// dots). Positions are stable within one call only.
    pub fn iterate(&self, mount: MountId, dir: InodeNumber, cursor: u64) -> Result<Vec<DirEntry>> {
        let chain = self.readable_chain(mount)?;
        let mut entries = resolve::enumerate(&chain, self.base(), dir)?;
        let skip = u64_to_usize(cursor, "iterate_cursor")?.min(entries.len());
        Ok(entries.split_off(skip))
    }

    // ── Shared validation ───────────────────────────────────────────────

    fn require_dir(&self, chain: &[Arc<BranchCtx>], ino: InodeNumber) -> Result<()> {
        let inode = resolve::resolve_inode(chain, self.base(), ino)?
            .ok_or_else(|| ForkFsError::NotFound(format!("inode {ino}")))?;
        if !is_dir(inode.mode) {
            return Err(ForkFsError::NotDirectory);
        }
        Ok(())
    }

    fn require_entry(
        &self,
        chain: &[Arc<BranchCtx>],
        parent: InodeNumber,
        name: &[u8],
    ) -> Result<ResolvedInode> {
        let ino = resolve::resolve_dirent(chain, self.base(), parent, name)?
            .ok_or_else(|| ForkFsError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
        resolve::resolve_inode(chain, self.base(), ino)?
            .ok_or_else(|| ForkFsError::NotFound(format!("inode {ino}")))
    }
}
