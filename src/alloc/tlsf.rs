//! Two-level segregated-fit allocator (Masmano et al.), grounded in the
//! shape of `aatlsf.c`'s `tlsfInit`/`tlsfMalloc`/`tlsfFree`/`tlsfRealloc`/
//! `tlsfCheck`/`tlsfGetStat` API, but with the block header redone as the
//! compact 4-byte `{prev offset, free, size, last-in-pool}` word: `aatlsf.c`
//! itself keeps two full pointers per block; this crate's arena is
//! addressed by slice offset the way every other index-based structure
//! here is, so the header only ever needs to be as wide as the slice count
//! of a ≤ 256 KB pool requires.
//!
//! `SLI_LOG2` and `SLICE` are fixed rather than const-generic because their
//! exponents would otherwise need `1 << SLI_LOG2`-sized arrays, which isn't
//! expressible with stable const generics; `FLI_MAX_INDEX` is the one
//! dimension that sizes an array directly, so it stays a const generic and
//! is the knob an application actually tunes to its pool size.

use crate::error::{Error, Result};

const SLICE: u32 = 8;
const SLI_LOG2: u32 = 4;
const SL_COUNT: usize = 1 << SLI_LOG2;
const MIN_BLOCK_SLICES: u32 = 2;
const NIL: u32 = u32::MAX;

const FREE_BIT: u32 = 1 << 15;
const LAST_BIT: u32 = 1 << 31;
const PREV_MASK: u32 = 0x7FFF;
const SIZE_SHIFT: u32 = 16;
const SIZE_MASK: u32 = 0x7FFF;

/// A two-level segregated-fit allocator over a single `'static` arena.
/// `FLI_MAX_INDEX` bounds how many power-of-two size classes exist above
/// the "small" bucket; 23 comfortably covers pools up to 256 KB at
/// `SLICE == 8`.
pub struct Tlsf<const FLI_MAX_INDEX: usize> {
    base: *mut u8,
    total_slices: u32,
    fl_bitmap: u32,
    sl_bitmap: [u32; FLI_MAX_INDEX],
    free_head: [[u32; SL_COUNT]; FLI_MAX_INDEX],
    used_bytes: usize,
    free_bytes: usize,
}

// SAFETY: `base` addresses a `'static` arena handed to `Tlsf::new` by the
// caller, who gives up exclusive access to it; every access goes through
// `&mut self`, so there is never more than one live `Tlsf` touching it.
unsafe impl<const FLI_MAX_INDEX: usize> Send for Tlsf<FLI_MAX_INDEX> {}

#[derive(Clone, Copy, Debug, Default)]
pub struct Stat {
    pub pool_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
}

impl<const FLI_MAX_INDEX: usize> Tlsf<FLI_MAX_INDEX> {
    /// Initialize a pool over `mem`, aligning the usable region up to 8
    /// bytes the way `aaInitMallocBloc` aligns its arena. `mem` must yield
    /// at least one minimum-size block after alignment.
    pub fn new(mem: &'static mut [u8]) -> Result<Self> {
        const { assert!(FLI_MAX_INDEX >= 1 && FLI_MAX_INDEX <= 30, "FLI_MAX_INDEX out of range") }
        let addr = mem.as_ptr() as usize;
        let pad = addr.next_multiple_of(SLICE as usize) - addr;
        if mem.len() < pad {
            return Err(Error::Arg);
        }
        let base = unsafe { mem.as_mut_ptr().add(pad) };
        let usable = mem.len() - pad;
        let total_slices = (usable / SLICE as usize) as u32;
        if total_slices < MIN_BLOCK_SLICES || total_slices > SIZE_MASK {
            return Err(Error::Arg);
        }

        let mut tlsf = Self {
            base,
            total_slices,
            fl_bitmap: 0,
            sl_bitmap: [0; FLI_MAX_INDEX],
            free_head: [[NIL; SL_COUNT]; FLI_MAX_INDEX],
            used_bytes: 0,
            free_bytes: usable - 4,
        };
        tlsf.write_header(0, 0, true, total_slices, true);
        tlsf.insert_free(0);
        Ok(tlsf)
    }

    fn block_ptr(&self, slice_off: u32) -> *mut u8 {
        unsafe { self.base.add(slice_off as usize * SLICE as usize) }
    }

    fn read_header(&self, slice_off: u32) -> (u32, bool, u32, bool) {
        // SAFETY: `slice_off` always addresses a live block header within the pool.
        let word = unsafe { self.block_ptr(slice_off).cast::<u32>().read_unaligned() };
        let prev = word & PREV_MASK;
        let free = word & FREE_BIT != 0;
        let size = (word >> SIZE_SHIFT) & SIZE_MASK;
        let last = word & LAST_BIT != 0;
        (prev, free, size, last)
    }

    fn write_header(&mut self, slice_off: u32, prev: u32, free: bool, size_slices: u32, last: bool) {
        let mut word = prev & PREV_MASK;
        if free {
            word |= FREE_BIT;
        }
        word |= (size_slices & SIZE_MASK) << SIZE_SHIFT;
        if last {
            word |= LAST_BIT;
        }
        // SAFETY: see `read_header`.
        unsafe { self.block_ptr(slice_off).cast::<u32>().write_unaligned(word) };
    }

    fn read_free_link(&self, slice_off: u32) -> (u32, u32) {
        // SAFETY: a free block's payload is unused by the application and
        // big enough (>= `MIN_BLOCK_SLICES * SLICE - 4` bytes) for two u32s.
        unsafe {
            let p = self.block_ptr(slice_off).add(4).cast::<u32>();
            (p.read_unaligned(), p.add(1).read_unaligned())
        }
    }

    fn write_free_link(&mut self, slice_off: u32, next: u32, prev: u32) {
        unsafe {
            let p = self.block_ptr(slice_off).add(4).cast::<u32>();
            p.write_unaligned(next);
            p.add(1).write_unaligned(prev);
        }
    }

    /// Map a slice count to `(fl, sl)`. Sizes under `SL_COUNT` slices share
    /// one linear bucket at `fl == 0`; everything else gets one power-of-two
    /// class per `fl`, split into `SL_COUNT` linear subclasses.
    fn mapping(size_slices: u32) -> (usize, usize) {
        if size_slices < SL_COUNT as u32 {
            return (0, size_slices as usize);
        }
        let fl_bit = 31 - size_slices.leading_zeros();
        let sl = (size_slices >> (fl_bit - SLI_LOG2)) & (SL_COUNT as u32 - 1);
        let fl = (fl_bit - SLI_LOG2 + 1) as usize;
        (fl, sl as usize)
    }

    /// Round a slice count up to the next bin boundary, so the bin
    /// `mapping` finds is guaranteed to only hold blocks `>= size_slices`.
    fn round_up_for_search(size_slices: u32) -> u32 {
        if size_slices < SL_COUNT as u32 {
            return size_slices;
        }
        let fl_bit = 31 - size_slices.leading_zeros();
        let lsb_mask = (1u32 << (fl_bit - SLI_LOG2)) - 1;
        size_slices.wrapping_add(lsb_mask) & !lsb_mask
    }

    fn insert_free(&mut self, slice_off: u32) {
        let (_, _, size, _) = self.read_header(slice_off);
        let (fl, sl) = Self::mapping(size);
        let head = self.free_head[fl][sl];
        self.write_free_link(slice_off, head, NIL);
        if head != NIL {
            let (h_next, _) = self.read_free_link(head);
            self.write_free_link(head, h_next, slice_off);
        }
        self.free_head[fl][sl] = slice_off;
        self.sl_bitmap[fl] |= 1 << sl;
        self.fl_bitmap |= 1 << fl;
    }

    fn remove_free(&mut self, slice_off: u32) {
        let (_, _, size, _) = self.read_header(slice_off);
        let (fl, sl) = Self::mapping(size);
        let (next, prev) = self.read_free_link(slice_off);
        if prev != NIL {
            let (p_next, p_prev) = self.read_free_link(prev);
            let _ = p_next;
            self.write_free_link(prev, next, p_prev);
        } else {
            self.free_head[fl][sl] = next;
        }
        if next != NIL {
            let (n_next, _) = self.read_free_link(next);
            self.write_free_link(next, n_next, prev);
        }
        if self.free_head[fl][sl] == NIL {
            self.sl_bitmap[fl] &= !(1 << sl);
            if self.sl_bitmap[fl] == 0 {
                self.fl_bitmap &= !(1 << fl);
            }
        }
    }

    /// Find the smallest free block at least `size_slices` slices, starting
    /// the search at `(fl, sl)` and widening by bitmap find-first-set.
    fn find_suitable(&self, fl: usize, sl: usize) -> Option<u32> {
        let sl_map = self.sl_bitmap[fl] & (u32::MAX << sl);
        if sl_map != 0 {
            let found_sl = sl_map.trailing_zeros() as usize;
            return Some(self.free_head[fl][found_sl]);
        }
        let fl_map = self.fl_bitmap & (u32::MAX << (fl + 1));
        if fl_map == 0 {
            return None;
        }
        let found_fl = fl_map.trailing_zeros() as usize;
        let found_sl = self.sl_bitmap[found_fl].trailing_zeros() as usize;
        Some(self.free_head[found_fl][found_sl])
    }

    fn next_phys(&self, slice_off: u32, size_slices: u32, last: bool) -> Option<u32> {
        if last {
            None
        } else {
            Some(slice_off + size_slices)
        }
    }

    /// Allocate `n` bytes, rounded up to slice and minimum-block size.
    /// Returns `Error::Memory` if no bin has a block big enough.
    pub fn alloc(&mut self, n: usize) -> Result<*mut u8> {
        if n == 0 {
            return Err(Error::Arg);
        }
        let want_slices = ((n as u32 + 4 + SLICE - 1) / SLICE).max(MIN_BLOCK_SLICES);
        let rounded = Self::round_up_for_search(want_slices);
        let (fl, sl) = Self::mapping(rounded);
        let block = self.find_suitable(fl, sl).ok_or(Error::Memory)?;
        self.remove_free(block);

        let (prev, _, size, last) = self.read_header(block);
        let remainder = size - want_slices;
        if remainder >= MIN_BLOCK_SLICES {
            self.write_header(block, prev, false, want_slices, false);
            let rem_off = block + want_slices;
            self.write_header(rem_off, want_slices, true, remainder, last);
            if let Some(next) = self.next_phys(rem_off, remainder, last) {
                let (n_prev, n_free, n_size, n_last) = self.read_header(next);
                let _ = n_prev;
                self.write_header(next, remainder, n_free, n_size, n_last);
            }
            self.insert_free(rem_off);
            self.used_bytes += want_slices as usize * SLICE as usize;
            self.free_bytes -= want_slices as usize * SLICE as usize;
        } else {
            self.write_header(block, prev, false, size, last);
            self.used_bytes += size as usize * SLICE as usize;
            self.free_bytes -= size as usize * SLICE as usize;
        }
        Ok(self.block_ptr(block).wrapping_add(4))
    }

    /// `calloc`-style allocation: zeroes the returned region.
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<*mut u8> {
        let n = count.checked_mul(size).ok_or(Error::Arg)?;
        if n == 0 {
            return Err(Error::Arg);
        }
        let ptr = self.alloc(n)?;
        unsafe { core::ptr::write_bytes(ptr, 0, n) };
        Ok(ptr)
    }

    fn offset_of(&self, ptr: *mut u8) -> Result<u32> {
        let delta = (ptr as usize).wrapping_sub(self.base as usize + 4);
        if delta % SLICE as usize != 0 {
            return Err(Error::Invalid);
        }
        let slice_off = (delta / SLICE as usize) as u32;
        if slice_off >= self.total_slices {
            return Err(Error::Invalid);
        }
        Ok(slice_off)
    }

    /// Release a block previously returned by `alloc`/`calloc`/`realloc`,
    /// coalescing with either physical neighbor that is also free.
    pub fn free(&mut self, ptr: *mut u8) -> Result<()> {
        let mut off = self.offset_of(ptr)?;
        let (mut prev, free, mut size, mut last) = self.read_header(off);
        if free {
            return Err(Error::Invalid);
        }
        self.used_bytes -= size as usize * SLICE as usize;
        self.free_bytes += size as usize * SLICE as usize;

        if !last {
            let next_off = off + size;
            let (n_prev, n_free, n_size, n_last) = self.read_header(next_off);
            let _ = n_prev;
            if n_free {
                self.remove_free(next_off);
                size += n_size;
                last = n_last;
                if let Some(after) = self.next_phys(off, size, last) {
                    let (_, a_free, a_size, a_last) = self.read_header(after);
                    self.write_header(after, size, a_free, a_size, a_last);
                }
            }
        }
        if off != 0 {
            let prev_off = prev;
            let (p_prev, p_free, p_size, _) = self.read_header(prev_off);
            if p_free {
                debug_assert_eq!(prev_off + p_size, off, "left-neighbor size/offset mismatch");
                self.remove_free(prev_off);
                off = prev_off;
                prev = p_prev;
                size += p_size;
            }
        }
        self.write_header(off, prev, true, size, last);
        if let Some(next) = self.next_phys(off, size, last) {
            let (_, n_free, n_size, n_last) = self.read_header(next);
            self.write_header(next, off, n_free, n_size, n_last);
        }
        self.insert_free(off);
        Ok(())
    }

    /// Resize a block in place when possible (shrink, or grow by absorbing
    /// an immediately-following free block); otherwise falls back to
    /// `alloc` + copy + `free`.
    pub fn realloc(&mut self, ptr: *mut u8, n: usize) -> Result<*mut u8> {
        if n == 0 {
            self.free(ptr)?;
            return Err(Error::Arg);
        }
        let off = self.offset_of(ptr)?;
        let (prev, free, size, last) = self.read_header(off);
        if free {
            return Err(Error::Invalid);
        }
        let want_slices = ((n as u32 + 4 + SLICE - 1) / SLICE).max(MIN_BLOCK_SLICES);

        if want_slices <= size {
            let remainder = size - want_slices;
            if remainder >= MIN_BLOCK_SLICES {
                self.write_header(off, prev, false, want_slices, false);
                let rem_off = off + want_slices;
                self.write_header(rem_off, want_slices, true, remainder, last);
                if let Some(next) = self.next_phys(rem_off, remainder, last) {
                    let (_, n_free, n_size, n_last) = self.read_header(next);
                    self.write_header(next, remainder, n_free, n_size, n_last);
                }
                self.insert_free(rem_off);
                self.used_bytes -= remainder as usize * SLICE as usize;
                self.free_bytes += remainder as usize * SLICE as usize;
            }
            return Ok(ptr);
        }

        if !last {
            let next_off = off + size;
            let (_, n_free, n_size, n_last) = self.read_header(next_off);
            if n_free && size + n_size >= want_slices {
                self.remove_free(next_off);
                let grown = size + n_size;
                self.used_bytes += n_size as usize * SLICE as usize;
                self.free_bytes -= n_size as usize * SLICE as usize;
                self.write_header(off, prev, false, grown, n_last);
                if let Some(after) = self.next_phys(off, grown, n_last) {
                    let (_, a_free, a_size, a_last) = self.read_header(after);
                    self.write_header(after, grown, a_free, a_size, a_last);
                }
                let remainder = grown - want_slices;
                if remainder >= MIN_BLOCK_SLICES {
                    self.write_header(off, prev, false, want_slices, false);
                    let rem_off = off + want_slices;
                    self.write_header(rem_off, want_slices, true, remainder, n_last);
                    if let Some(after) = self.next_phys(rem_off, remainder, n_last) {
                        let (_, a_free, a_size, a_last) = self.read_header(after);
                        self.write_header(after, remainder, a_free, a_size, a_last);
                    }
                    self.insert_free(rem_off);
                    self.used_bytes -= remainder as usize * SLICE as usize;
                    self.free_bytes += remainder as usize * SLICE as usize;
                }
                return Ok(ptr);
            }
        }

        let new_ptr = self.alloc(n)?;
        let old_bytes = (size as usize * SLICE as usize).saturating_sub(4);
        let copy_len = old_bytes.min(n);
        unsafe { core::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len) };
        self.free(ptr)?;
        Ok(new_ptr)
    }

    /// Walk every physical block once, verifying neighbor-size reciprocity
    /// and free-list membership. Bounded by the block count, never loops.
    pub fn check(&self) -> Result<()> {
        let mut off = 0u32;
        loop {
            let (prev, free, size, last) = self.read_header(off);
            if size < MIN_BLOCK_SLICES || off + size > self.total_slices {
                return Err(Error::Corrupt);
            }
            if off != 0 {
                let (_, _, p_size, _) = self.read_header(prev);
                if prev + p_size != off {
                    return Err(Error::Corrupt);
                }
            }
            if free {
                let (fl, sl) = Self::mapping(size);
                if self.sl_bitmap[fl] & (1 << sl) == 0 {
                    return Err(Error::Corrupt);
                }
            }
            match self.next_phys(off, size, last) {
                Some(next) => off = next,
                None => break,
            }
        }
        Ok(())
    }

    pub fn stat(&self) -> Stat {
        Stat {
            pool_bytes: self.total_slices as usize * SLICE as usize,
            used_bytes: self.used_bytes,
            free_bytes: self.free_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use quickcheck_macros::quickcheck;
    use std::{boxed::Box, vec, vec::Vec};

    fn arena(bytes: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; bytes].into_boxed_slice())
    }

    #[test]
    fn alloc_free_round_trip_restores_free_bytes() {
        let mut t: Tlsf<16> = Tlsf::new(arena(4096)).unwrap();
        let before = t.stat().free_bytes;
        let p = t.alloc(100).unwrap();
        assert!(t.stat().free_bytes < before);
        t.free(p).unwrap();
        assert_eq!(t.stat().free_bytes, before);
        t.check().unwrap();
    }

    #[test]
    fn coalesces_adjacent_frees() {
        let mut t: Tlsf<16> = Tlsf::new(arena(4096)).unwrap();
        let a = t.alloc(64).unwrap();
        let b = t.alloc(64).unwrap();
        let c = t.alloc(64).unwrap();
        t.free(b).unwrap();
        t.free(a).unwrap();
        t.free(c).unwrap();
        t.check().unwrap();
        assert_eq!(t.stat().used_bytes, 0);
    }

    #[test]
    fn exhausted_pool_returns_memory_error() {
        let mut t: Tlsf<8> = Tlsf::new(arena(64)).unwrap();
        assert!(t.alloc(1000).is_err());
    }

    #[test]
    fn realloc_grow_and_shrink() {
        let mut t: Tlsf<16> = Tlsf::new(arena(4096)).unwrap();
        let p = t.alloc(32).unwrap();
        unsafe { core::ptr::write_bytes(p, 0xAB, 32) };
        let p2 = t.realloc(p, 512).unwrap();
        let mut buf = [0u8; 32];
        unsafe { core::ptr::copy_nonoverlapping(p2, buf.as_mut_ptr(), 32) };
        assert_eq!(buf, [0xABu8; 32]);
        let p3 = t.realloc(p2, 16).unwrap();
        t.check().unwrap();
        t.free(p3).unwrap();
    }

    // S5: random alloc/free interleaving; `check()` must hold after every
    // step and all bytes come back free once everything is released.
    #[quickcheck]
    fn stress_alloc_free_preserves_invariants(sizes: Vec<u16>) -> bool {
        let mut t: Tlsf<16> = Tlsf::new(arena(16384)).unwrap();
        let before = t.stat().free_bytes;
        let mut live = Vec::new();
        for (i, raw) in sizes.iter().enumerate() {
            let n = (*raw as usize % 512) + 1;
            match t.alloc(n) {
                Ok(p) => live.push(p),
                Err(_) => {}
            }
            if t.check().is_err() {
                return false;
            }
            if i % 3 == 0 {
                if let Some(p) = live.pop() {
                    if t.free(p).is_err() {
                        return false;
                    }
                }
            }
        }
        for p in live {
            if t.free(p).is_err() {
                return false;
            }
        }
        t.check().is_ok() && t.stat().free_bytes == before
    }
}
