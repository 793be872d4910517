//! Read-side resolution.
//!
//! Every read query walks the branch chain from leaf to root and falls back
//! to the base image only when no branch decides. Tombstones censor deeper
//! branches and the base; data chunks are clamped wherever a leafward write
//! owns the tail bytes.

use crate::branch::BranchCtx;
use forkfs_delta::WriteChunk;
use forkfs_error::{ForkFsError, Result};
use forkfs_ondisk::base::BaseImage;
use forkfs_ondisk::record::{DeltaRecord, LogIter};
use forkfs_types::{InodeNumber, S_IFDIR, is_dir};
use std::sync::Arc;

/// Fully resolved inode attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedInode {
    pub ino: InodeNumber,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub mtime: u64,
}

/// One directory entry produced by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub name: Vec<u8>,
    pub mode: u32,
}

/// Resolve `ino` to attributes, or `None` if absent or deleted.
///
/// Branches are consulted leaf to root; each contributes the fields its
/// latest record carried, so a SETATTR in a child overrides exactly the
/// masked fields while the rest still come from an ancestor or the base.
/// A tombstone censors everything deeper.
pub fn resolve_inode(
    chain: &[Arc<BranchCtx>],
    base: Option<&BaseImage>,
    ino: InodeNumber,
) -> Result<Option<ResolvedInode>> {
    // Sizes merge in two tiers: write extents only raise a floor, while the
    // leaf-most exact size (create/truncate/setattr) pins the value. A floor
    // recorded leafward of the pin still wins, because those writes are
    // newer than the pinning record.
    let mut size_floor = 0_u64;
    let mut size_exact = None;
    let mut mode = None;
    let mut uid = None;
    let mut gid = None;
    let mut mtime = None;
    let mut found = false;
    let mut censored = false;

    for branch in chain {
        if let Some(entry) = branch.log.lookup_inode(ino) {
            if entry.deleted {
                if !found {
                    return Ok(None);
                }
                censored = true;
                break;
            }
            found = true;
            if let Some(size) = entry.size
                && size_exact.is_none()
            {
                if entry.size_exact {
                    size_exact = Some(size);
                } else {
                    size_floor = size_floor.max(size);
                }
            }
            mode = mode.or(entry.mode);
            uid = uid.or(entry.uid);
            gid = gid.or(entry.gid);
            mtime = mtime.or(Some(entry.mtime));
        }
    }

    if !censored
        && let Some(base) = base
        && let Some(inode) = base.inode(ino)?
    {
        let size = size_exact.map_or_else(
            || size_floor.max(inode.size),
            |exact| exact.max(size_floor),
        );
        return Ok(Some(ResolvedInode {
            ino,
            mode: mode.unwrap_or(inode.mode),
            uid: uid.unwrap_or(inode.uid),
            gid: gid.unwrap_or(inode.gid),
            size,
            nlink: inode.nlink,
            mtime: mtime.unwrap_or(0),
        }));
    }

    if found {
        let size = size_exact.map_or(size_floor, |exact| exact.max(size_floor));
        return Ok(Some(ResolvedInode {
            ino,
            mode: mode.unwrap_or(0),
            uid: uid.unwrap_or(0),
            gid: gid.unwrap_or(0),
            size,
            nlink: 1,
            mtime: mtime.unwrap_or(0),
        }));
    }

    // With no base image the root directory exists implicitly.
    if ino == InodeNumber::ROOT && base.is_none() {
        return Ok(Some(ResolvedInode {
            ino,
            mode: S_IFDIR | 0o755,
            uid: 0,
            gid: 0,
            size: 0,
            nlink: 2,
            mtime: 0,
        }));
    }

    Ok(None)
}

/// Resolve `(parent, name)` to an inode, or `None` when the name does not
/// exist at the leaf. The leaf-most decisive record wins outright.
pub fn resolve_dirent(
    chain: &[Arc<BranchCtx>],
    base: Option<&BaseImage>,
    parent: InodeNumber,
    name: &[u8],
) -> Result<Option<InodeNumber>> {
    for branch in chain {
        if let Some(decision) = branch.log.lookup_dirent(parent, name) {
            return Ok(if decision.deleted {
                None
            } else {
                Some(decision.ino)
            });
        }
    }

    if let Some(base) = base
        && let Some(child) = base.lookup_child(parent, name)?
    {
        let ino = InodeNumber(u64::from(child.ino));
        for branch in chain {
            if branch.log.is_deleted(ino) {
                return Ok(None);
            }
        }
        return Ok(Some(ino));
    }

    Ok(None)
}

/// Resolve file data covering `pos`: the leaf-most branch with a covering
/// WRITE wins, otherwise the base image serves the bytes. Chunks served
/// from deeper sources are clamped where a leafward write begins, so every
/// byte comes from its closest-to-leaf writer.
pub fn resolve_data(
    chain: &[Arc<BranchCtx>],
    base: Option<&BaseImage>,
    ino: InodeNumber,
    pos: u64,
) -> Result<Option<WriteChunk>> {
    for (depth, branch) in chain.iter().enumerate() {
        if let Some(mut chunk) = branch.log.resolve_write(ino, pos)? {
            clamp_to_leafward(&chain[..depth], ino, pos, &mut chunk)?;
            return Ok(Some(chunk));
        }
    }

    if let Some(base) = base
        && let Some(inode) = base.inode(ino)?
        && let Some((data_offset, avail)) = base.data_range(&inode, pos)?
    {
        let mut chunk = WriteChunk { data_offset, avail };
        clamp_to_leafward(chain, ino, pos, &mut chunk)?;
        return Ok(Some(chunk));
    }

    Ok(None)
}

fn clamp_to_leafward(
    leafward: &[Arc<BranchCtx>],
    ino: InodeNumber,
    pos: u64,
    chunk: &mut WriteChunk,
) -> Result<()> {
    for branch in leafward {
        if let Some(start) = branch
            .log
            .min_write_start_in(ino, pos, pos.saturating_add(chunk.avail))?
        {
            chunk.avail = start - pos;
        }
    }
    Ok(())
}

/// Enumerate the live entries of `dir`, dots first, then surviving base
/// children, then branch-created entries leaf to root.
///
/// A base child survives only if no branch deleted its inode and no
/// leafward record re-decided its name. A branch record emits an entry only
/// while it is still the authoritative decision for that name within its
/// own branch, is not shadowed by a leafward branch, and its inode is not
/// deleted at or leafward of the emitting branch.
pub fn enumerate(
    chain: &[Arc<BranchCtx>],
    base: Option<&BaseImage>,
    dir: InodeNumber,
) -> Result<Vec<DirEntry>> {
    let Some(dir_inode) = resolve_inode(chain, base, dir)? else {
        return Err(ForkFsError::NotFound(format!("directory inode {dir}")));
    };
    if !is_dir(dir_inode.mode) {
        return Err(ForkFsError::NotDirectory);
    }

    let parent_ino = match base {
        Some(base) => base
            .inode(dir)?
            .map(|inode| InodeNumber(u64::from(inode.parent_ino.max(1)))),
        None => None,
    }
    .unwrap_or(dir);

    let mut entries = vec![
        DirEntry {
            ino: dir,
            name: b".".to_vec(),
            mode: S_IFDIR,
        },
        DirEntry {
            ino: parent_ino,
            name: b"..".to_vec(),
            mode: S_IFDIR,
        },
    ];

    if let Some(base) = base {
        for child in base.children(dir)? {
            let ino = InodeNumber(u64::from(child.ino));
            if chain.iter().any(|b| b.log.is_deleted(ino)) {
                continue;
            }
            let name = base.name_of(&child)?;
            // A leafward record owning this name replaces the base answer
            // (tombstone, rename, or re-creation under the same name).
            if chain
                .iter()
                .any(|b| b.log.lookup_dirent(dir, &name).is_some())
            {
                continue;
            }
            entries.push(DirEntry {
                ino,
                name,
                mode: child.mode,
            });
        }
    }

    for (depth, branch) in chain.iter().enumerate() {
        let log = branch.log.read_log()?;
        for entry in LogIter::new(&log) {
            let entry = entry.map_err(|err| ForkFsError::Corruption {
                offset: 0,
                detail: format!("delta log scan failed: {err}"),
            })?;
            let Some(record) = entry.record else { continue };
            let (name, ino, mode) = match record {
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
                } if parent == dir => (name, new_ino, Some(mode)),
                DeltaRecord::Rename {
                    new_parent,
                    ino,
                    new_name,
                    ..
                } if new_parent == dir => (new_name, ino, None),
                _ => continue,
            };

            // Still the authoritative record for this name in its branch?
            let authoritative = branch
                .log
                .lookup_dirent(dir, name)
                .is_some_and(|d| !d.deleted && d.record_offset == entry.offset);
            if !authoritative {
                continue;
            }
            // Shadowed by a leafward branch's decision for the same name?
            if chain[..depth]
                .iter()
                .any(|b| b.log.lookup_dirent(dir, name).is_some())
            {
                continue;
            }
            // Inode deleted at or leafward of this branch?
            if chain[..=depth].iter().any(|b| b.log.is_deleted(ino)) {
                continue;
            }

            let mode = match mode {
                Some(mode) => mode,
                None => resolve_inode(chain, base, ino)?.map_or(0, |inode| inode.mode),
            };
            entries.push(DirEntry {
                ino,
                name: name.to_vec(),
                mode,
            });
        }
    }

    Ok(entries)
}

/// `true` when `dir` holds no live entries beyond `.` and `..`.
pub fn dir_is_empty(
    chain: &[Arc<BranchCtx>],
    base: Option<&BaseImage>,
    dir: InodeNumber,
) -> Result<bool> {
    Ok(enumerate(chain, base, dir)?.len() <= 2)
}
