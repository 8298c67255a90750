//! Fixed-size buffer pool: a free list of same-size blocks carved out of a
//! caller-owned arena, intended for zero-allocation inter-task and
//! ISR-to-task data exchange.
//!
//! `aamemblock.c`'s `aaMallocBloc` only ever bumps a cursor forward and
//! never frees, which doesn't fit a pool that's handed back and forth
//! indefinitely; what carries over from it is the arena-ownership shape
//! (one descriptor over one caller-supplied block of memory, no per-block
//! overhead beyond what the free list itself needs). The free list is
//! threaded through the blocks' own payload the way the TLSF allocator's
//! free blocks are, and waiters block the same way a semaphore's do.

use crate::bsp::Bsp;
use crate::error::{Error, Result};
use crate::handle::{Handle, PoolId, INFINITE_TIMEOUT};
use crate::kernel::Kernel;
use crate::task::{State, WaitOn, WakeCause};
use crate::util::dlist::ListHead;

const NIL: u32 = u32::MAX;

pub struct Pool {
    pub(crate) in_use: bool,
    buf: *mut u8,
    block_size: usize,
    capacity: usize,
    free_head: u32,
    free_count: usize,
    pub(crate) waiters: ListHead,
}

// SAFETY: `buf` addresses a `'static` buffer handed to `pool_create` by the
// caller, who gives up exclusive access to it; blocks are only ever handed
// out one at a time by `take` and the kernel never reads/writes a block's
// payload itself except for the free-list link while it's on the free list.
unsafe impl Send for Pool {}

impl Pool {
    pub(crate) fn new() -> Self {
        Self {
            in_use: false,
            buf: core::ptr::null_mut(),
            block_size: 0,
            capacity: 0,
            free_head: NIL,
            free_count: 0,
            waiters: ListHead::EMPTY,
        }
    }

    fn block_ptr(&self, i: u32) -> *mut u8 {
        // SAFETY: `i < capacity` for every caller within this file.
        unsafe { self.buf.add(i as usize * self.block_size) }
    }

    fn read_link(&self, i: u32) -> u32 {
        // SAFETY: block `i` is on the free list, so nothing else holds a
        // reference to its payload right now, and `block_size >= 4`.
        unsafe { self.block_ptr(i).cast::<u32>().read_unaligned() }
    }

    fn write_link(&self, i: u32, next: u32) {
        // SAFETY: same as `read_link`.
        unsafe { self.block_ptr(i).cast::<u32>().write_unaligned(next) }
    }
}

impl<
        const TASKS: usize,
        const PRIORITIES: usize,
        const MUTEXES: usize,
        const SEMS: usize,
        const QUEUES: usize,
        const TIMERS: usize,
        const POOLS: usize,
        B: Bsp,
    > Kernel<TASKS, PRIORITIES, MUTEXES, SEMS, QUEUES, TIMERS, POOLS, B>
{
    pub(crate) fn resolve_pool(&self, id: PoolId) -> Result<u16> {
        let idx = id.index();
        if idx >= POOLS || !self.pools[idx].in_use {
            return Err(Error::Arg);
        }
        Ok(idx as u16)
    }

    /// Carve `storage` into `block_size`-byte blocks. `block_size` must be
    /// at least 4 bytes (to hold the free-list link) and divide evenly
    /// into `storage.len()`.
    pub fn pool_create(&mut self, storage: &'static mut [u8], block_size: usize) -> Result<PoolId> {
        if block_size < 4 || storage.len() < block_size || storage.len() % block_size != 0 {
            return Err(Error::Arg);
        }
        let capacity = storage.len() / block_size;
        if capacity as u64 >= NIL as u64 {
            return Err(Error::Arg);
        }
        self.critical_enter();
        let idx = self.pools.iter().position(|p| !p.in_use);
        if let Some(idx) = idx {
            self.pools[idx] = Pool::new();
            self.pools[idx].in_use = true;
            self.pools[idx].buf = storage.as_mut_ptr();
            self.pools[idx].block_size = block_size;
            self.pools[idx].capacity = capacity;
            self.pools[idx].free_count = capacity;
            for i in 0..capacity as u32 {
                let next = if i + 1 == capacity as u32 { NIL } else { i + 1 };
                self.pools[idx].write_link(i, next);
            }
            self.pools[idx].free_head = 0;
        }
        self.critical_exit();
        idx.map(|i| PoolId::from_index(i as u16)).ok_or(Error::Depleted)
    }

    pub fn pool_delete(&mut self, id: PoolId) -> Result<()> {
        let idx = self.resolve_pool(id)?;
        self.critical_enter();
        if !self.pools[idx as usize].waiters.is_empty() || self.pools[idx as usize].free_count != self.pools[idx as usize].capacity {
            self.critical_exit();
            return Err(Error::State);
        }
        self.pools[idx as usize].in_use = false;
        self.critical_exit();
        Ok(())
    }

    /// Free blocks currently available.
    pub fn pool_free_count(&self, id: PoolId) -> Result<usize> {
        let idx = self.resolve_pool(id)?;
        Ok(self.pools[idx as usize].free_count)
    }

    /// Block size in bytes, for callers that only have the `PoolId`.
    pub fn pool_block_size(&self, id: PoolId) -> Result<usize> {
        let idx = self.resolve_pool(id)?;
        Ok(self.pools[idx as usize].block_size)
    }

    /// Take one block, waiting up to `timeout` ticks if the pool is
    /// exhausted. Not ISR-safe with a nonzero timeout.
    pub fn pool_take(&mut self, id: PoolId, timeout: u32) -> Result<*mut u8> {
        let idx = self.resolve_pool(id)?;
        self.critical_enter();
        if let Some(ptr) = self.pop_free_locked(idx) {
            self.critical_exit();
            return Ok(ptr);
        }
        if self.is_in_isr() || timeout == 0 {
            self.critical_exit();
            return if timeout == 0 { Err(Error::WouldBlock) } else { Err(Error::NotAllowed) };
        }
        let cur = match self.current {
            Some(c) => c,
            None => {
                self.critical_exit();
                return Err(Error::State);
            }
        };
        self.tasks[cur as usize].state = State::WaitingIo;
        self.tasks[cur as usize].wake_cause = WakeCause::None;
        let mut waiters = self.pools[idx as usize].waiters;
        self.wait_enqueue(&mut waiters, cur, WaitOn::Pool(idx));
        self.pools[idx as usize].waiters = waiters;
        if timeout != INFINITE_TIMEOUT {
            self.delay_list_insert(cur, timeout);
        }
        self.critical_exit();
        self.schedule();

        match self.tasks[cur as usize].wake_cause {
            WakeCause::Timeout => Err(Error::Timeout),
            WakeCause::Cancel | WakeCause::Flush => Err(Error::Flush),
            WakeCause::Event => {
                self.critical_enter();
                let ptr = self.pop_free_locked(idx);
                self.critical_exit();
                ptr.ok_or(Error::Fail)
            }
            WakeCause::None => Err(Error::Fail),
        }
    }

    /// Return a block previously obtained from `pool_take`. ISR-safe.
    pub fn pool_give(&mut self, id: PoolId, ptr: *mut u8) -> Result<()> {
        let idx = self.resolve_pool(id)?;
        self.critical_enter();
        let p = &self.pools[idx as usize];
        let offset = (ptr as usize).wrapping_sub(p.buf as usize);
        if offset % p.block_size != 0 || offset / p.block_size >= p.capacity {
            self.critical_exit();
            return Err(Error::Arg);
        }
        let i = (offset / p.block_size) as u32;
        self.pools[idx as usize].write_link(i, self.pools[idx as usize].free_head);
        self.pools[idx as usize].free_head = i;
        self.pools[idx as usize].free_count += 1;
        let mut waiters = self.pools[idx as usize].waiters;
        self.wake_one(&mut waiters, WakeCause::Event);
        self.pools[idx as usize].waiters = waiters;
        self.critical_exit();
        self.schedule();
        Ok(())
    }

    fn pop_free_locked(&mut self, idx: u16) -> Option<*mut u8> {
        let p = &self.pools[idx as usize];
        if p.free_head == NIL {
            return None;
        }
        let i = p.free_head;
        let next = p.read_link(i);
        self.pools[idx as usize].free_head = next;
        self.pools[idx as usize].free_count -= 1;
        Some(self.pools[idx as usize].block_ptr(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CreateFlags;
    use core::cell::Cell;

    struct TestBsp {
        switches: Cell<u32>,
    }
    impl Bsp for TestBsp {
        fn irq_save_disable(&self) -> u32 {
            0
        }
        fn irq_restore(&self, _state: u32) {}
        fn irq_enable_all(&self) {}
        fn irq_disable_all(&self) {}
        fn trigger_context_switch(&self) {
            self.switches.set(self.switches.get() + 1);
        }
        fn tick_configure(&self, _hz: u32) {}
        fn tick_stretch_until(&self, _delta: u32) {}
        fn cycle_counter(&self) -> u32 {
            0
        }
    }

    type TestKernel = Kernel<2, 4, 0, 0, 0, 0, 2, TestBsp>;

    fn entry(_arg: usize) {}

    #[test]
    fn take_and_give_round_trip() {
        static mut BUF: [u8; 32] = [0; 32];
        let mut k = TestKernel::new(TestBsp { switches: Cell::new(0) });
        let p = k.pool_create(unsafe { &mut *core::ptr::addr_of_mut!(BUF) }, 8).unwrap();
        k.current = Some(0);
        static mut STACK: [u32; 16] = [0; 16];
        let _t = k
            .task_create(1, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK) }, CreateFlags::empty())
            .unwrap();
        assert_eq!(k.pool_free_count(p).unwrap(), 4);
        let a = k.pool_take(p, 0).unwrap();
        let b = k.pool_take(p, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(k.pool_free_count(p).unwrap(), 2);
        k.pool_give(p, a).unwrap();
        assert_eq!(k.pool_free_count(p).unwrap(), 3);
        k.pool_give(p, b).unwrap();
        assert_eq!(k.pool_free_count(p).unwrap(), 4);
    }

    #[test]
    fn take_from_exhausted_pool_with_zero_timeout_would_block() {
        static mut BUF: [u8; 8] = [0; 8];
        let mut k = TestKernel::new(TestBsp { switches: Cell::new(0) });
        let p = k.pool_create(unsafe { &mut *core::ptr::addr_of_mut!(BUF) }, 8).unwrap();
        k.current = Some(0);
        static mut STACK: [u32; 16] = [0; 16];
        let _t = k
            .task_create(1, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK) }, CreateFlags::empty())
            .unwrap();
        let _blk = k.pool_take(p, 0).unwrap();
        assert_eq!(k.pool_take(p, 0), Err(Error::WouldBlock));
    }

    #[test]
    fn give_of_unowned_pointer_is_rejected() {
        static mut BUF: [u8; 8] = [0; 8];
        let mut k = TestKernel::new(TestBsp { switches: Cell::new(0) });
        let p = k.pool_create(unsafe { &mut *core::ptr::addr_of_mut!(BUF) }, 8).unwrap();
        let mut stray = 0u8;
        assert_eq!(k.pool_give(p, &mut stray as *mut u8), Err(Error::Arg));
    }
}
