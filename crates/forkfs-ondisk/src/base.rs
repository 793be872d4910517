//! Embedded read-only base image.
//!
//! The base image is an optional snapshot laid out at image-format time:
//! its own superblock, a fixed-size inode table (1-based; inode *i* in slot
//! *i-1*), a string table holding names, and a data area. Directories are
//! linked lists threaded through `first_child` / `next_sibling`.
//!
//! [`BaseImage`] is the read path of last resort for the resolver;
//! [`BaseImageBuilder`] is the image-writer counterpart used by `mkfs`.

use crate::format::align_block;
use forkfs_error::{ForkFsError, Result};
use forkfs_types::{
    BASE_INODE_SIZE, ByteOffset, FORKFS_BASE_MAGIC, FORKFS_BLOCK_SIZE, InodeNumber, ParseError,
    S_IFDIR, SUPERBLOCK_SIZE, is_dir, put_bytes, read_le_u32, read_le_u64, u64_to_usize,
    usize_to_u32, write_le_u32, write_le_u64,
};
use forkfs_window::Window;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Base image superblock, padded to one block at `base_offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseSuperblock {
    pub flags: u32,
    pub total_size: u64,
    pub inode_offset: u64,
    pub inode_count: u32,
    pub root_inode: u32,
    pub strtab_offset: u64,
    pub strtab_size: u64,
    pub data_offset: u64,
}

impl BaseSuperblock {
    pub fn parse(region: &[u8]) -> std::result::Result<Self, ParseError> {
        let magic = read_le_u32(region, 0)?;
        if magic != FORKFS_BASE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(FORKFS_BASE_MAGIC),
                actual: u64::from(magic),
            });
        }
        let version = read_le_u32(region, 4)?;
        if version != 1 {
            return Err(ParseError::InvalidField {
                field: "base_version",
                reason: "unsupported base image version",
            });
        }
        Ok(Self {
            flags: read_le_u32(region, 8)?,
            total_size: read_le_u64(region, 16)?,
            inode_offset: read_le_u64(region, 24)?,
            inode_count: read_le_u32(region, 32)?,
            root_inode: read_le_u32(region, 36)?,
            strtab_offset: read_le_u64(region, 40)?,
            strtab_size: read_le_u64(region, 48)?,
            data_offset: read_le_u64(region, 56)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        let _ = write_le_u32(&mut region, 0, FORKFS_BASE_MAGIC);
        let _ = write_le_u32(&mut region, 4, 1);
        let _ = write_le_u32(&mut region, 8, self.flags);
        let _ = write_le_u32(&mut region, 12, FORKFS_BLOCK_SIZE);
        let _ = write_le_u64(&mut region, 16, self.total_size);
        let _ = write_le_u64(&mut region, 24, self.inode_offset);
        let _ = write_le_u32(&mut region, 32, self.inode_count);
        let _ = write_le_u32(&mut region, 36, self.root_inode);
        let _ = write_le_u64(&mut region, 40, self.strtab_offset);
        let _ = write_le_u64(&mut region, 48, self.strtab_size);
        let _ = write_le_u64(&mut region, 56, self.data_offset);
        region
    }
}

/// One 64-byte base image inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseInode {
    pub ino: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub data_offset: u64,
    pub name_offset: u32,
    pub name_len: u32,
    pub parent_ino: u32,
    pub nlink: u32,
    pub first_child: u32,
    pub next_sibling: u32,
}

impl BaseInode {
    pub fn parse(record: &[u8]) -> std::result::Result<Self, ParseError> {
        if record.len() < BASE_INODE_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BASE_INODE_SIZE,
                offset: 0,
                actual: record.len(),
            });
        }
        Ok(Self {
            ino: read_le_u32(record, 0)?,
            mode: read_le_u32(record, 4)?,
            uid: read_le_u32(record, 8)?,
            gid: read_le_u32(record, 12)?,
            size: read_le_u64(record, 16)?,
            data_offset: read_le_u64(record, 24)?,
            name_offset: read_le_u32(record, 32)?,
            name_len: read_le_u32(record, 36)?,
            parent_ino: read_le_u32(record, 40)?,
            nlink: read_le_u32(record, 44)?,
            first_child: read_le_u32(record, 48)?,
            next_sibling: read_le_u32(record, 52)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut record = vec![0_u8; BASE_INODE_SIZE];
        let _ = write_le_u32(&mut record, 0, self.ino);
        let _ = write_le_u32(&mut record, 4, self.mode);
        let _ = write_le_u32(&mut record, 8, self.uid);
        let _ = write_le_u32(&mut record, 12, self.gid);
        let _ = write_le_u64(&mut record, 16, self.size);
        let _ = write_le_u64(&mut record, 24, self.data_offset);
        let _ = write_le_u32(&mut record, 32, self.name_offset);
        let _ = write_le_u32(&mut record, 36, self.name_len);
        let _ = write_le_u32(&mut record, 40, self.parent_ino);
        let _ = write_le_u32(&mut record, 44, self.nlink);
        let _ = write_le_u32(&mut record, 48, self.first_child);
        let _ = write_le_u32(&mut record, 52, self.next_sibling);
        record
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        is_dir(self.mode)
    }
}

/// Reader over an embedded base image inside a storage window.
pub struct BaseImage {
    window: Arc<dyn Window>,
    base_offset: ByteOffset,
    sb: BaseSuperblock,
}

impl BaseImage {
    /// Open the base image at `base_offset` in `window`.
    pub fn open(window: Arc<dyn Window>, base_offset: ByteOffset) -> Result<Self> {
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        window.read_exact_at(base_offset, &mut region)?;
        let sb = BaseSuperblock::parse(&region)?;
        Ok(Self {
            window,
            base_offset,
            sb,
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &BaseSuperblock {
        &self.sb
    }

    #[must_use]
    pub fn inode_count(&self) -> u32 {
        self.sb.inode_count
    }

    /// Whether `ino` addresses a base inode slot.
    #[must_use]
    pub fn contains(&self, ino: InodeNumber) -> bool {
        ino.0 >= 1 && ino.0 <= u64::from(self.sb.inode_count)
    }

    fn rel(&self, offset: u64) -> Result<ByteOffset> {
        self.base_offset
            .checked_add(offset)
            .ok_or(ForkFsError::Invalid("base-relative offset overflows u64"))
    }

    /// Read the inode record for `ino`, or `None` if out of range.
    pub fn inode(&self, ino: InodeNumber) -> Result<Option<BaseInode>> {
        if !self.contains(ino) {
            return Ok(None);
        }
        let slot = (ino.0 - 1)
            .checked_mul(u64::try_from(BASE_INODE_SIZE).unwrap_or(u64::MAX))
            .and_then(|rel| self.sb.inode_offset.checked_add(rel))
            .ok_or(ForkFsError::Invalid("inode slot offset overflows u64"))?;
        let mut record = vec![0_u8; BASE_INODE_SIZE];
        self.window.read_exact_at(self.rel(slot)?, &mut record)?;
        Ok(Some(BaseInode::parse(&record)?))
    }

    /// Read an inode's name from the string table.
    pub fn name_of(&self, inode: &BaseInode) -> Result<Vec<u8>> {
        let len = u64::from(inode.name_len);
        let end = u64::from(inode.name_offset)
            .checked_add(len)
            .ok_or(ForkFsError::Invalid("name range overflows u64"))?;
        if end > self.sb.strtab_size {
            return Err(ForkFsError::Corruption {
                offset: self.base_offset.0 + self.sb.strtab_offset,
                detail: format!("inode {} name overruns string table", inode.ino),
            });
        }
        let mut name = vec![0_u8; u64_to_usize(len, "name_len")?];
        self.window.read_exact_at(
            self.rel(self.sb.strtab_offset + u64::from(inode.name_offset))?,
            &mut name,
        )?;
        Ok(name)
    }

    /// Walk `parent`'s sibling-linked children and return the child named
    /// `name`, if present.
    pub fn lookup_child(&self, parent: InodeNumber, name: &[u8]) -> Result<Option<BaseInode>> {
        for child in self.children(parent)? {
            if self.name_of(&child)? == name {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    /// All children of `parent` in sibling-chain order.
    pub fn children(&self, parent: InodeNumber) -> Result<Vec<BaseInode>> {
        let Some(dir) = self.inode(parent)? else {
            return Ok(Vec::new());
        };
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut child_ino = dir.first_child;
        // The chain cannot legitimately be longer than the inode table;
        // anything past that is a sibling-link cycle.
        let mut budget = self.sb.inode_count;
        while child_ino != 0 && child_ino <= self.sb.inode_count {
            if budget == 0 {
                return Err(ForkFsError::Corruption {
                    offset: self.base_offset.0 + self.sb.inode_offset,
                    detail: format!("sibling cycle under directory inode {parent}"),
                });
            }
            budget -= 1;
            let Some(child) = self.inode(InodeNumber(u64::from(child_ino)))? else {
                break;
            };
            child_ino = child.next_sibling;
            out.push(child);
        }
        Ok(out)
    }

    /// Absolute window range of `inode`'s data from `pos` to EOF, or `None`
    /// at or past EOF.
    pub fn data_range(&self, inode: &BaseInode, pos: u64) -> Result<Option<(ByteOffset, u64)>> {
        if pos >= inode.size {
            return Ok(None);
        }
        let start = self.rel(
            inode
                .data_offset
                .checked_add(pos)
                .ok_or(ForkFsError::Invalid("data offset overflows u64"))?,
        )?;
        Ok(Some((start, inode.size - pos)))
    }
}

#[derive(Debug)]
struct BuilderNode {
    mode: u32,
    uid: u32,
    gid: u32,
    name: Vec<u8>,
    parent: u32,
    data: Vec<u8>,
}

/// Builds a base image byte-for-byte: superblock, inode table, string
/// table, data area. Children are sibling-linked in insertion order.
#[derive(Debug)]
pub struct BaseImageBuilder {
    nodes: Vec<BuilderNode>,
}

impl Default for BaseImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseImageBuilder {
    /// Start a new image containing only the root directory (inode 1).
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![BuilderNode {
                mode: S_IFDIR | 0o755,
                uid: 0,
                gid: 0,
                name: Vec::new(),
                parent: 0,
                data: Vec::new(),
            }],
        }
    }

    #[must_use]
    pub fn root(&self) -> InodeNumber {
        InodeNumber::ROOT
    }

    fn parent_slot(&self, parent: InodeNumber) -> Result<usize> {
        let slot = u64_to_usize(
            parent
                .0
                .checked_sub(1)
                .ok_or(ForkFsError::Invalid("inode numbers are 1-based"))?,
            "parent_ino",
        )?;
        let node = self
            .nodes
            .get(slot)
            .ok_or_else(|| ForkFsError::NotFound(format!("base inode {parent}")))?;
        if !is_dir(node.mode) {
            return Err(ForkFsError::NotDirectory);
        }
        Ok(slot)
    }

    fn add_node(
        &mut self,
        parent: InodeNumber,
        name: &str,
        mode: u32,
        data: Vec<u8>,
    ) -> Result<InodeNumber> {
        let parent_slot = self.parent_slot(parent)?;
        if name.is_empty() || name.contains('/') || name.contains('\0') {
            return Err(ForkFsError::Invalid("bad entry name"));
        }
        let parent_u32 = usize_to_u32(parent_slot + 1, "parent_ino")?;
        for node in &self.nodes {
            if node.parent == parent_u32 && node.name == name.as_bytes() {
                return Err(ForkFsError::Exists);
            }
        }

        self.nodes.push(BuilderNode {
            mode,
            uid: 0,
            gid: 0,
            name: name.as_bytes().to_vec(),
            parent: parent_u32,
            data,
        });
        Ok(InodeNumber(u64::try_from(self.nodes.len()).map_err(
            |_| ForkFsError::Invalid("inode count overflows u64"),
        )?))
    }

    /// Add a directory under `parent`; returns its inode number.
    pub fn add_dir(&mut self, parent: InodeNumber, name: &str, perm: u32) -> Result<InodeNumber> {
        self.add_node(parent, name, S_IFDIR | (perm & 0o7777), Vec::new())
    }

    /// Add a regular file with inline contents under `parent`.
    pub fn add_file(
        &mut self,
        parent: InodeNumber,
        name: &str,
        perm: u32,
        data: &[u8],
    ) -> Result<InodeNumber> {
        self.add_node(
            parent,
            name,
            forkfs_types::S_IFREG | (perm & 0o7777),
            data.to_vec(),
        )
    }

    /// Emit the finished base image.
    pub fn build(&self) -> Result<Vec<u8>> {
        let count = self.nodes.len();
        let inode_offset = u64::try_from(SUPERBLOCK_SIZE)
            .map_err(|_| ForkFsError::Invalid("superblock size overflows u64"))?;
        let table_bytes = u64::try_from(count * BASE_INODE_SIZE)
            .map_err(|_| ForkFsError::Invalid("inode table overflows u64"))?;
        let strtab_offset = inode_offset + table_bytes;

        // String table: concatenated names in inode order.
        let mut strtab = Vec::new();
        let mut name_offsets = Vec::with_capacity(count);
        for node in &self.nodes {
            name_offsets.push(usize_to_u32(strtab.len(), "name_offset")?);
            strtab.extend_from_slice(&node.name);
        }
        let strtab_size = u64::try_from(strtab.len())
            .map_err(|_| ForkFsError::Invalid("string table overflows u64"))?;

        let data_offset = align_block(strtab_offset + strtab_size)?;

        // Data area: file contents in inode order.
        let mut data_area = Vec::new();
        let mut data_offsets = Vec::with_capacity(count);
        for node in &self.nodes {
            data_offsets.push(
                data_offset
                    + u64::try_from(data_area.len())
                        .map_err(|_| ForkFsError::Invalid("data area overflows u64"))?,
            );
            data_area.extend_from_slice(&node.data);
        }

        // Sibling chains in insertion order, and nlink: 2 per directory
        // plus one per child directory.
        let mut first_child = vec![0_u32; count];
        let mut next_sibling = vec![0_u32; count];
        let mut last_child_of = vec![0_usize; count];
        let mut nlink = vec![0_u32; count];
        for (slot, node) in self.nodes.iter().enumerate() {
            nlink[slot] = if is_dir(node.mode) { 2 } else { 1 };
        }
        for (slot, node) in self.nodes.iter().enumerate() {
            if node.parent == 0 {
                continue;
            }
            let parent_slot = usize::try_from(node.parent - 1)
                .map_err(|_| ForkFsError::Invalid("parent slot overflows usize"))?;
            let ino = usize_to_u32(slot + 1, "ino")?;
            if first_child[parent_slot] == 0 {
                first_child[parent_slot] = ino;
            } else {
                next_sibling[last_child_of[parent_slot]] = ino;
            }
            last_child_of[parent_slot] = slot;
            if is_dir(node.mode) {
                nlink[parent_slot] += 1;
            }
        }

        let total_size = data_offset
            + u64::try_from(data_area.len())
                .map_err(|_| ForkFsError::Invalid("data area overflows u64"))?;

        let sb = BaseSuperblock {
            flags: 0,
            total_size,
            inode_offset,
            inode_count: usize_to_u32(count, "inode_count")?,
            root_inode: 1,
            strtab_offset,
            strtab_size,
            data_offset,
        };

        let mut image = vec![0_u8; u64_to_usize(total_size, "base_total_size")?];
        put_bytes(&mut image, 0, &sb.encode())?;
        for (slot, node) in self.nodes.iter().enumerate() {
            let inode = BaseInode {
                ino: usize_to_u32(slot + 1, "ino")?,
                mode: node.mode,
                uid: node.uid,
                gid: node.gid,
                size: u64::try_from(node.data.len())
                    .map_err(|_| ForkFsError::Invalid("file size overflows u64"))?,
                data_offset: data_offsets[slot],
                name_offset: name_offsets[slot],
                name_len: usize_to_u32(node.name.len(), "name_len")?,
                parent_ino: node.parent,
                nlink: nlink[slot],
                first_child: first_child[slot],
                next_sibling: next_sibling[slot],
            };
            put_bytes(
                &mut image,
                u64_to_usize(inode_offset, "inode_offset")? + slot * BASE_INODE_SIZE,
                &inode.encode(),
            )?;
        }
        put_bytes(&mut image, u64_to_usize(strtab_offset, "strtab_offset")?, &strtab)?;
        put_bytes(&mut image, u64_to_usize(data_offset, "data_offset")?, &data_area)?;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkfs_window::MemWindow;

    fn open_built(builder: &BaseImageBuilder) -> BaseImage {
        let image = builder.build().expect("build");
        let window: Arc<dyn Window> = Arc::new(MemWindow::from_vec(image));
        BaseImage::open(window, ByteOffset::ZERO).expect("open")
    }

    #[test]
    fn base_superblock_round_trip() {
        let sb = BaseSuperblock {
            flags: 0,
            total_size: 20480,
            inode_offset: 4096,
            inode_count: 3,
            root_inode: 1,
            strtab_offset: 4288,
            strtab_size: 17,
            data_offset: 8192,
        };
        assert_eq!(BaseSuperblock::parse(&sb.encode()).expect("parse"), sb);
    }

    #[test]
    fn base_inode_round_trip() {
        let inode = BaseInode {
            ino: 2,
            mode: forkfs_types::S_IFREG | 0o644,
            uid: 1000,
            gid: 1000,
            size: 21,
            data_offset: 8192,
            name_offset: 0,
            name_len: 9,
            parent_ino: 1,
            nlink: 1,
            first_child: 0,
            next_sibling: 3,
        };
        assert_eq!(BaseInode::parse(&inode.encode()).expect("parse"), inode);
    }

    #[test]
    fn builder_produces_readable_image() {
        let mut builder = BaseImageBuilder::new();
        let root = builder.root();
        builder
            .add_file(root, "hello.txt", 0o644, b"Hello from base image")
            .expect("file");
        let subdir = builder.add_dir(root, "subdir", 0o755).expect("dir");
        builder
            .add_file(subdir, "nested.txt", 0o644, b"nested")
            .expect("nested");

        let image = open_built(&builder);
        assert_eq!(image.inode_count(), 4);

        let root_inode = image.inode(InodeNumber::ROOT).expect("io").expect("root");
        assert!(root_inode.is_dir());
        assert_eq!(root_inode.nlink, 3);

        let hello = image
            .lookup_child(InodeNumber::ROOT, b"hello.txt")
            .expect("io")
            .expect("hello.txt");
        assert_eq!(hello.size, 21);
        let (start, avail) = image
            .data_range(&hello, 0)
            .expect("io")
            .expect("data present");
        assert_eq!(avail, 21);
        let mut data = vec![0_u8; 21];
        image.window.read_exact_at(start, &mut data).expect("read");
        assert_eq!(&data, b"Hello from base image");

        let nested = image
            .lookup_child(subdir, b"nested.txt")
            .expect("io")
            .expect("nested.txt");
        assert_eq!(nested.parent_ino, 3);
    }

    #[test]
    fn builder_rejects_duplicates_and_bad_parents() {
        let mut builder = BaseImageBuilder::new();
        let root = builder.root();
        let file = builder.add_file(root, "a", 0o644, b"1").expect("file");
        assert!(matches!(
            builder.add_file(root, "a", 0o644, b"2"),
            Err(ForkFsError::Exists)
        ));
        assert!(matches!(
            builder.add_file(file, "b", 0o644, b"3"),
            Err(ForkFsError::NotDirectory)
        ));
        assert!(matches!(
            builder.add_dir(InodeNumber(99), "c", 0o755),
            Err(ForkFsError::NotFound(_))
        ));
        assert!(builder.add_dir(root, "with/slash", 0o755).is_err());
    }

    #[test]
    fn children_follow_insertion_order() {
        let mut builder = BaseImageBuilder::new();
        let root = builder.root();
        for name in ["one", "two", "three"] {
            builder.add_file(root, name, 0o644, b"x").expect("file");
        }
        let image = open_built(&builder);
        let names: Vec<Vec<u8>> = image
            .children(InodeNumber::ROOT)
            .expect("children")
            .iter()
            .map(|child| image.name_of(child).expect("name"))
            .collect();
        assert_eq!(names, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn data_range_clamps_at_eof() {
        let mut builder = BaseImageBuilder::new();
        let root = builder.root();
        builder.add_file(root, "f", 0o644, b"abcdef").expect("file");
        let image = open_built(&builder);
        let inode = image
            .lookup_child(InodeNumber::ROOT, b"f")
            .expect("io")
            .expect("f");
        let (_, avail) = image.data_range(&inode, 4).expect("io").expect("mid");
        assert_eq!(avail, 2);
        assert!(image.data_range(&inode, 6).expect("io").is_none());
        assert!(image.data_range(&inode, 100).expect("io").is_none());
    }
}
