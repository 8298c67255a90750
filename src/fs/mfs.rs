//! Minimalistic read-only filesystem, grounded on `mfs.c`/`mfs.h`'s
//! `mfsMount`/`mfsOpen`/`mfsRead`/`mfsSeek`/`mfsStat`/`mfsDirOpen`/
//! `mfsDirRead`.
//!
//! The original addresses directory and file entries with raw pointers,
//! since its image is mapped directly into the address space it runs from.
//! This crate has no such guarantee — the image may live behind SPI flash,
//! a partition, or a host file — so every on-disk link (`first_block`,
//! directory `parent`/`prev`/`next`) is a block *number*, resolved to a
//! byte address via `block_num << block_power2` only at the point of use,
//! the same shift the original already does for `mfsFile_t::dataAddress`.
//! Block number `0` never denotes a directory or file block (block 0 is
//! always the superblock), so it doubles as the "no link" sentinel in
//! place of the original's null pointer.

use crate::error::{Error, Result};
use arrayvec::ArrayVec;

const MAGIC: u32 = 0x4141_3546; // "AA5F"
const FS_VERSION: u32 = (1 << 16) | 0;

const SUPERBLOCK_LEN: usize = 24;
const DIR_HEADER_LEN: u32 = 16;
const ENTRY_HEADER_LEN: u8 = 8;

/// Max bytes of an encoded directory entry (header + name); mirrors
/// `MFS_ENTRY_SIZE_MAX` sized for a 512 B block, 5 entries minimum.
pub const ENTRY_SIZE_MAX: usize = 96;
/// Max name length an entry can carry, `ENTRY_SIZE_MAX` minus the header.
pub const NAME_MAX: usize = ENTRY_SIZE_MAX - ENTRY_HEADER_LEN as usize;

const FLAG_DIR: u8 = 1;
const FLAG_FILE: u8 = 2;

pub type ReadFn = fn(user_data: usize, address: u32, buf: &mut [u8]) -> Result<()>;
pub type LockFn = fn(user_data: usize);

fn no_lock(_user_data: usize) {}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntryKind {
    Dir,
    File,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct FsStat {
    pub kind: EntryKind,
    pub size: i32,
}

#[derive(Clone, Copy)]
struct EntryHdr {
    flags: u8,
    block_num: u16,
    file_size: i32,
}

/// Mounted filesystem handle: the user's read/lock callbacks plus the
/// superblock fields cached by [`mount`]. `Copy` so [`MfsFile`]/[`MfsDir`]
/// cursors can each carry their own snapshot without a borrow.
#[derive(Clone, Copy)]
pub struct MfsCtx {
    user_data: usize,
    read: ReadFn,
    lock: LockFn,
    unlock: LockFn,
    block_power2: u32,
    fs_crc: u32,
    fs_size: u32,
}

impl MfsCtx {
    fn block_address(&self, block_num: u16) -> u32 {
        (block_num as u32) << self.block_power2
    }

    fn read_into(&self, address: u32, buf: &mut [u8]) -> Result<()> {
        (self.lock)(self.user_data);
        let r = (self.read)(self.user_data, address, buf);
        (self.unlock)(self.user_data);
        r
    }

    /// CRC-32 recorded in the superblock at build time, usable to detect
    /// whether the backing image changed without re-walking it.
    pub fn fs_crc(&self) -> u32 {
        self.fs_crc
    }

    pub fn fs_size(&self) -> u32 {
        self.fs_size
    }

    fn read_dir_header(&self, block_num: u16) -> Result<(u16, u32)> {
        let mut hdr = [0u8; DIR_HEADER_LEN as usize];
        self.read_into(self.block_address(block_num), &mut hdr)?;
        let next = u32::from_le_bytes(hdr[8..12].try_into().unwrap());
        let count = u32::from_le_bytes(hdr[12..16].try_into().unwrap());
        if next > u16::MAX as u32 {
            return Err(Error::Corrupt);
        }
        Ok((next as u16, count))
    }

    fn read_entry_at(&self, address: u32) -> Result<(EntryHdr, u8, ArrayVec<u8, NAME_MAX>)> {
        let mut hdr = [0u8; ENTRY_HEADER_LEN as usize];
        self.read_into(address, &mut hdr)?;
        let entry_size = hdr[0];
        let flags = hdr[1];
        let block_num = u16::from_le_bytes(hdr[2..4].try_into().unwrap());
        let file_size = i32::from_le_bytes(hdr[4..8].try_into().unwrap());
        if entry_size < ENTRY_HEADER_LEN || entry_size as usize > ENTRY_SIZE_MAX {
            return Err(Error::Corrupt);
        }
        let name_len = (entry_size - ENTRY_HEADER_LEN) as usize;
        let mut name = ArrayVec::<u8, NAME_MAX>::new();
        name.extend(core::iter::repeat(0u8).take(name_len));
        self.read_into(address + ENTRY_HEADER_LEN as u32, &mut name)?;
        Ok((EntryHdr { flags, block_num, file_size }, entry_size, name))
    }

    /// Search one directory (following its `next` chain) for `name`.
    fn search_dir(&self, mut dir_block: u16, name: &[u8]) -> Result<EntryHdr> {
        loop {
            let (next, count) = self.read_dir_header(dir_block)?;
            let mut addr = self.block_address(dir_block) + DIR_HEADER_LEN;
            for _ in 0..count {
                let (hdr, entry_size, entry_name) = self.read_entry_at(addr)?;
                if entry_name.as_slice() == name {
                    return Ok(hdr);
                }
                addr += entry_size as u32;
            }
            if next == 0 {
                return Err(Error::NotFound);
            }
            dir_block = next;
        }
    }

    /// Resolve an absolute path to the entry header of its last segment.
    fn search_path(&self, path: &str) -> Result<EntryHdr> {
        if path.is_empty() || !path.starts_with('/') {
            return Err(Error::Invalid);
        }
        if path == "/" {
            return Ok(EntryHdr { flags: FLAG_DIR, block_num: 1, file_size: -1 });
        }
        let mut dir_block: u16 = 1;
        let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
        loop {
            let seg = match segments.next() {
                Some(s) => s,
                None => return Err(Error::Invalid),
            };
            let hdr = self.search_dir(dir_block, seg.as_bytes())?;
            if segments.peek().is_none() {
                return Ok(hdr);
            }
            if hdr.flags & FLAG_DIR == 0 {
                return Err(Error::NotFound);
            }
            dir_block = hdr.block_num;
        }
    }

    /// `stat(path)`: resolve without opening, reporting entry kind and size.
    pub fn stat(&self, path: &str) -> Result<FsStat> {
        let hdr = self.search_path(path)?;
        let kind = if hdr.flags & FLAG_FILE != 0 { EntryKind::File } else { EntryKind::Dir };
        Ok(FsStat { kind, size: hdr.file_size })
    }

    /// Open a file for reading. `Error::NotFound` if `path` names a
    /// directory or doesn't exist.
    pub fn open(&self, path: &str) -> Result<MfsFile> {
        let hdr = self.search_path(path)?;
        if hdr.flags & FLAG_FILE == 0 {
            return Err(Error::NotFound);
        }
        Ok(MfsFile {
            ctx: *self,
            data_address: self.block_address(hdr.block_num),
            file_size: hdr.file_size,
            position: 0,
        })
    }

    /// Open a directory cursor. `Error::NotFound` if `path` doesn't exist,
    /// `Error::Invalid` if it names a file.
    pub fn dir_open(&self, path: &str) -> Result<MfsDir> {
        let hdr = self.search_path(path)?;
        if hdr.flags & FLAG_DIR == 0 {
            return Err(Error::Invalid);
        }
        let (next, count) = self.read_dir_header(hdr.block_num)?;
        Ok(MfsDir {
            ctx: *self,
            block: hdr.block_num,
            next,
            count,
            index: 0,
            offset: self.block_address(hdr.block_num) + DIR_HEADER_LEN,
        })
    }
}

/// Validate the superblock at block 0 and build a mounted context.
/// `lock`/`unlock` may be omitted when the backing store needs no
/// serialization.
pub fn mount(user_data: usize, read: ReadFn, lock: Option<LockFn>, unlock: Option<LockFn>) -> Result<MfsCtx> {
    let lock = lock.unwrap_or(no_lock);
    let unlock = unlock.unwrap_or(no_lock);
    let mut hdr = [0u8; SUPERBLOCK_LEN];
    lock(user_data);
    let r = read(user_data, 0, &mut hdr);
    unlock(user_data);
    r?;

    let magic = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
    let version = u32::from_le_bytes(hdr[4..8].try_into().unwrap());
    let block_size = u32::from_le_bytes(hdr[8..12].try_into().unwrap());
    let block_power2 = u32::from_le_bytes(hdr[12..16].try_into().unwrap());
    let fs_size = u32::from_le_bytes(hdr[16..20].try_into().unwrap());
    let fs_crc = u32::from_le_bytes(hdr[20..24].try_into().unwrap());

    if magic != MAGIC || version != FS_VERSION || block_size != 1u32 << block_power2 {
        return Err(Error::Corrupt);
    }

    Ok(MfsCtx { user_data, read, lock, unlock, block_power2, fs_crc, fs_size })
}

pub enum Whence {
    Set,
    Cur,
    End,
}

/// An open file cursor. Carries its own copy of [`MfsCtx`], so it outlives
/// any particular mount call's stack frame.
pub struct MfsFile {
    ctx: MfsCtx,
    data_address: u32,
    file_size: i32,
    position: i32,
}

impl MfsFile {
    pub fn size(&self) -> i32 {
        self.file_size
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Copy up to `buf.len()` bytes starting at the current position,
    /// clamped to the file's remaining length, and advance the position.
    /// Returns the count actually read; `0` signals end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.position == self.file_size {
            return Ok(0);
        }
        let remaining = (self.file_size - self.position) as usize;
        let n = buf.len().min(remaining);
        if n == 0 {
            return Ok(0);
        }
        self.ctx.read_into(self.data_address + self.position as u32, &mut buf[..n])?;
        self.position += n as i32;
        Ok(n)
    }

    /// Reposition the cursor; returns the resulting absolute position.
    pub fn seek(&mut self, offset: i32, whence: Whence) -> Result<i32> {
        let new_pos = match whence {
            Whence::Set => offset,
            Whence::Cur => self.position.checked_add(offset).ok_or(Error::Invalid)?,
            Whence::End => self.file_size.checked_add(offset).ok_or(Error::Invalid)?,
        };
        if new_pos < 0 || new_pos > self.file_size {
            return Err(Error::Invalid);
        }
        self.position = new_pos;
        Ok(self.position)
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct DirEntry {
    pub kind: EntryKind,
    pub size: i32,
    pub name: ArrayVec<u8, NAME_MAX>,
}

/// A directory-walk cursor returned by [`MfsCtx::dir_open`], read one entry
/// at a time by [`MfsDir::read`], following chained directory blocks.
pub struct MfsDir {
    ctx: MfsCtx,
    block: u16,
    next: u16,
    count: u32,
    index: u32,
    offset: u32,
}

impl MfsDir {
    /// Read the next entry, or `Error::NotFound` once the directory (and
    /// every chained block) is exhausted.
    pub fn read(&mut self) -> Result<DirEntry> {
        if self.index == self.count {
            if self.next == 0 {
                return Err(Error::NotFound);
            }
            self.block = self.next;
            let (next, count) = self.ctx.read_dir_header(self.block)?;
            self.next = next;
            self.count = count;
            self.index = 0;
            self.offset = self.ctx.block_address(self.block) + DIR_HEADER_LEN;
            if self.count == 0 {
                return Err(Error::NotFound);
            }
        }
        let (hdr, entry_size, name) = self.ctx.read_entry_at(self.offset)?;
        self.offset += entry_size as u32;
        self.index += 1;
        let kind = if hdr.flags & FLAG_FILE != 0 { EntryKind::File } else { EntryKind::Dir };
        Ok(DirEntry { kind, size: hdr.file_size, name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::vec::Vec;

    // user_data is the address of a leaked `Vec<u8>` holding the whole image.
    // Builds: "/" -> a.txt (5B "hello"), "/d/" -> b.txt (3B "abc"), "/d/e/" -> c.txt (0B)
    fn test_read(user_data: usize, address: u32, buf: &mut [u8]) -> Result<()> {
        let img: &Vec<u8> = unsafe { &*(user_data as *const Vec<u8>) };
        let addr = address as usize;
        if addr + buf.len() > img.len() {
            return Err(Error::Io);
        }
        buf.copy_from_slice(&img[addr..addr + buf.len()]);
        Ok(())
    }

    fn put_u32(v: &mut Vec<u8>, x: u32) {
        v.extend_from_slice(&x.to_le_bytes());
    }

    fn dir_entry(v: &mut Vec<u8>, flags: u8, block_num: u16, file_size: i32, name: &[u8]) {
        let entry_size = ENTRY_HEADER_LEN as usize + name.len();
        v.push(entry_size as u8);
        v.push(flags);
        v.extend_from_slice(&block_num.to_le_bytes());
        v.extend_from_slice(&file_size.to_le_bytes());
        v.extend_from_slice(name);
    }

    const BLOCK: usize = 512;

    fn build_image() -> Vec<u8> {
        // Block 0: superblock. Block 1: root dir. Block 2: /d dir.
        // Block 3: /d/e dir. Block 4: a.txt data. Block 5: b.txt data.
        let mut img = Vec::new();
        img.resize(BLOCK, 0);
        put_u32(&mut img, MAGIC);
        put_u32(&mut img, FS_VERSION);
        put_u32(&mut img, BLOCK as u32);
        put_u32(&mut img, 9); // 1<<9 == 512
        put_u32(&mut img, 0);
        put_u32(&mut img, 0);

        let mut root = Vec::new();
        put_u32(&mut root, 0); // parent
        put_u32(&mut root, 0); // prev
        put_u32(&mut root, 0); // next
        put_u32(&mut root, 2); // count
        dir_entry(&mut root, FLAG_FILE, 4, 5, b"a.txt");
        dir_entry(&mut root, FLAG_DIR, 2, -1, b"d");
        root.resize(BLOCK, 0);

        let mut d = Vec::new();
        put_u32(&mut d, 1);
        put_u32(&mut d, 0);
        put_u32(&mut d, 0);
        put_u32(&mut d, 2);
        dir_entry(&mut d, FLAG_FILE, 5, 3, b"b.txt");
        dir_entry(&mut d, FLAG_DIR, 3, -1, b"e");
        d.resize(BLOCK, 0);

        let mut e = Vec::new();
        put_u32(&mut e, 2);
        put_u32(&mut e, 0);
        put_u32(&mut e, 0);
        put_u32(&mut e, 1);
        dir_entry(&mut e, FLAG_FILE, 0, 0, b"c.txt");
        e.resize(BLOCK, 0);

        let mut a_data = std::vec![0u8; BLOCK];
        a_data[..5].copy_from_slice(b"hello");
        let mut b_data = std::vec![0u8; BLOCK];
        b_data[..3].copy_from_slice(b"abc");

        img.extend(root);
        img.extend(d);
        img.extend(e);
        img.extend(a_data);
        img.extend(b_data);
        img
    }

    fn mounted() -> MfsCtx {
        let img = Box::leak(Box::new(build_image()));
        let user_data = img as *const Vec<u8> as usize;
        mount(user_data, test_read, None, None).unwrap()
    }

    #[test]
    fn stat_file_and_dir() {
        let ctx = mounted();
        let s = ctx.stat("/a.txt").unwrap();
        assert_eq!(s.kind, EntryKind::File);
        assert_eq!(s.size, 5);
        let s = ctx.stat("/d").unwrap();
        assert_eq!(s.kind, EntryKind::Dir);
        assert_eq!(ctx.stat("/nope"), Err(Error::NotFound));
    }

    #[test]
    fn open_and_read_file() {
        let ctx = mounted();
        let mut f = ctx.open("/a.txt").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(f.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(f.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn seek_clamps_to_file_bounds() {
        let ctx = mounted();
        let mut f = ctx.open("/a.txt").unwrap();
        assert_eq!(f.seek(2, Whence::Set).unwrap(), 2);
        let mut buf = [0u8; 3];
        assert_eq!(f.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"llo");
        assert_eq!(f.seek(100, Whence::Set), Err(Error::Invalid));
    }

    #[test]
    fn nested_path_and_directory_walk() {
        let ctx = mounted();
        let s = ctx.stat("/d/b.txt").unwrap();
        assert_eq!(s.size, 3);
        let mut dir = ctx.dir_open("/d").unwrap();
        let first = dir.read().unwrap();
        assert_eq!(first.name.as_slice(), b"b.txt");
        assert_eq!(first.kind, EntryKind::File);
        let second = dir.read().unwrap();
        assert_eq!(second.name.as_slice(), b"e");
        assert_eq!(second.kind, EntryKind::Dir);
        assert_eq!(dir.read(), Err(Error::NotFound));
    }
}
