//! Fixed-size message queue, grounded in the wait-queue idiom shared with
//! `mutex.rs`/`semaphore.rs` but with two wait lists instead of one: a full
//! queue parks senders, an empty queue parks receivers, mirroring
//! `aabase.h`'s `aaQueueSend`/`aaQueueReceive` pair.
//!
//! The backing storage is a caller-owned `'static` byte slice handed to
//! [`Kernel::queue_create`], sliced into fixed-size elements, rather than
//! an inline array — `QUEUES` entries in the kernel's queue table would
//! otherwise all have to share one compile-time element size and capacity.

use crate::bsp::Bsp;
use crate::error::{Error, Result};
use crate::handle::{Handle, QueueId, INFINITE_TIMEOUT};
use crate::kernel::Kernel;
use crate::task::{State, WaitOn, WakeCause};
use crate::util::dlist::ListHead;

pub struct Queue {
    pub(crate) in_use: bool,
    buf: *mut u8,
    elem_size: usize,
    capacity: usize,
    head: usize,
    tail: usize,
    count: usize,
    pub(crate) send_waiters: ListHead,
    pub(crate) recv_waiters: ListHead,
}

// SAFETY: `buf` addresses a `'static` buffer handed to `queue_create` by the
// caller, who gives up exclusive access to it; the kernel only ever touches
// it from within a critical section.
unsafe impl Send for Queue {}

impl Queue {
    pub(crate) fn new() -> Self {
        Self {
            in_use: false,
            buf: core::ptr::null_mut(),
            elem_size: 0,
            capacity: 0,
            head: 0,
            tail: 0,
            count: 0,
            send_waiters: ListHead::EMPTY,
            recv_waiters: ListHead::EMPTY,
        }
    }

    fn slot(&self, i: usize) -> *mut u8 {
        // SAFETY: `i < capacity` is upheld by every caller, and `buf` spans
        // `capacity * elem_size` bytes for the lifetime of this queue.
        unsafe { self.buf.add(i * self.elem_size) }
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
    pub(crate) fn resolve_queue(&self, id: QueueId) -> Result<u16> {
        let idx = id.index();
        if idx >= QUEUES || !self.queues[idx].in_use {
            return Err(Error::Arg);
        }
        Ok(idx as u16)
    }

    /// Build a queue of `elem_size`-byte elements over `storage`, which must
    /// be an exact multiple of `elem_size` and at least one element long.
    pub fn queue_create(&mut self, storage: &'static mut [u8], elem_size: usize) -> Result<QueueId> {
        if elem_size == 0 || storage.len() < elem_size || storage.len() % elem_size != 0 {
            return Err(Error::Arg);
        }
        self.critical_enter();
        let idx = self.queues.iter().position(|q| !q.in_use);
        if let Some(idx) = idx {
            self.queues[idx] = Queue::new();
            self.queues[idx].in_use = true;
            self.queues[idx].buf = storage.as_mut_ptr();
            self.queues[idx].elem_size = elem_size;
            self.queues[idx].capacity = storage.len() / elem_size;
        }
        self.critical_exit();
        idx.map(|i| QueueId::from_index(i as u16)).ok_or(Error::Depleted)
    }

    pub fn queue_delete(&mut self, id: QueueId) -> Result<()> {
        let idx = self.resolve_queue(id)?;
        self.critical_enter();
        if !self.queues[idx as usize].send_waiters.is_empty() || !self.queues[idx as usize].recv_waiters.is_empty() {
            self.critical_exit();
            return Err(Error::State);
        }
        self.queues[idx as usize].in_use = false;
        self.critical_exit();
        Ok(())
    }

    /// Number of elements currently queued.
    pub fn queue_count(&self, id: QueueId) -> Result<usize> {
        let idx = self.resolve_queue(id)?;
        Ok(self.queues[idx as usize].count)
    }

    /// Copy one element into the queue, waiting up to `timeout` ticks if
    /// it's full. `data.len()` must equal the element size exactly.
    pub fn queue_send(&mut self, id: QueueId, data: &[u8], timeout: u32) -> Result<()> {
        let idx = self.resolve_queue(id)?;
        if data.len() != self.queues[idx as usize].elem_size {
            return Err(Error::Arg);
        }
        self.critical_enter();
        if self.queues[idx as usize].count < self.queues[idx as usize].capacity {
            self.enqueue_locked(idx, data);
            let mut recv = self.queues[idx as usize].recv_waiters;
            self.wake_one(&mut recv, WakeCause::Event);
            self.queues[idx as usize].recv_waiters = recv;
            self.critical_exit();
            self.schedule();
            return Ok(());
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
        self.tasks[cur as usize].state = State::WaitingQueue;
        self.tasks[cur as usize].wake_cause = WakeCause::None;
        let mut send = self.queues[idx as usize].send_waiters;
        self.wait_enqueue(&mut send, cur, WaitOn::QueueSend(idx));
        self.queues[idx as usize].send_waiters = send;
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
                self.enqueue_locked(idx, data);
                self.critical_exit();
                Ok(())
            }
            WakeCause::None => Ok(()),
        }
    }

    /// Copy one element out of the queue into `out`, waiting up to
    /// `timeout` ticks if it's empty. `out.len()` must equal the element
    /// size exactly.
    pub fn queue_receive(&mut self, id: QueueId, out: &mut [u8], timeout: u32) -> Result<()> {
        let idx = self.resolve_queue(id)?;
        if out.len() != self.queues[idx as usize].elem_size {
            return Err(Error::Arg);
        }
        self.critical_enter();
        if self.queues[idx as usize].count > 0 {
            self.dequeue_locked(idx, out);
            let mut send = self.queues[idx as usize].send_waiters;
            self.wake_one(&mut send, WakeCause::Event);
            self.queues[idx as usize].send_waiters = send;
            self.critical_exit();
            self.schedule();
            return Ok(());
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
        self.tasks[cur as usize].state = State::WaitingQueue;
        self.tasks[cur as usize].wake_cause = WakeCause::None;
        let mut recv = self.queues[idx as usize].recv_waiters;
        self.wait_enqueue(&mut recv, cur, WaitOn::QueueRecv(idx));
        self.queues[idx as usize].recv_waiters = recv;
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
                self.dequeue_locked(idx, out);
                self.critical_exit();
                Ok(())
            }
            WakeCause::None => Ok(()),
        }
    }

    /// Copy the front element into `out` without removing it.
    /// `Error::WouldBlock` if the queue is empty.
    pub fn queue_peek(&self, id: QueueId, out: &mut [u8]) -> Result<()> {
        let idx = self.resolve_queue(id)?;
        let q = &self.queues[idx as usize];
        if out.len() != q.elem_size {
            return Err(Error::Arg);
        }
        if q.count == 0 {
            return Err(Error::WouldBlock);
        }
        // SAFETY: `head` is always in `0..capacity` while `count > 0`.
        let src = unsafe { core::slice::from_raw_parts(q.slot(q.head), q.elem_size) };
        out.copy_from_slice(src);
        Ok(())
    }

    /// Empty the queue, waking every blocked sender since room has opened
    /// up (mirrors the ready-sender behavior a run of individual receives
    /// would have produced, without requiring the caller to drain by hand).
    pub fn queue_purge(&mut self, id: QueueId) -> Result<()> {
        let idx = self.resolve_queue(id)?;
        self.critical_enter();
        self.queues[idx as usize].head = 0;
        self.queues[idx as usize].tail = 0;
        self.queues[idx as usize].count = 0;
        let mut send = self.queues[idx as usize].send_waiters;
        self.wake_all(&mut send, WakeCause::Event);
        self.queues[idx as usize].send_waiters = send;
        self.critical_exit();
        self.schedule();
        Ok(())
    }

    /// Append one element, assuming capacity was already checked by the
    /// caller. Must be called inside the critical section.
    fn enqueue_locked(&mut self, idx: u16, data: &[u8]) {
        let q = &mut self.queues[idx as usize];
        let tail = q.tail;
        // SAFETY: `tail < capacity`, `data.len() == elem_size` was checked
        // by every public caller.
        unsafe { core::slice::from_raw_parts_mut(q.slot(tail), q.elem_size) }.copy_from_slice(data);
        q.tail = (tail + 1) % q.capacity;
        q.count += 1;
    }

    /// Remove the front element, assuming non-emptiness was already
    /// checked. Must be called inside the critical section.
    fn dequeue_locked(&mut self, idx: u16, out: &mut [u8]) {
        let q = &mut self.queues[idx as usize];
        let head = q.head;
        // SAFETY: `head < capacity`, `q.count > 0` was checked by the caller.
        let src = unsafe { core::slice::from_raw_parts(q.slot(head), q.elem_size) };
        out.copy_from_slice(src);
        q.head = (head + 1) % q.capacity;
        q.count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsp::Bsp;
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

    type TestKernel = Kernel<2, 4, 0, 0, 2, 0, 0, TestBsp>;

    fn entry(_arg: usize) {}

    #[test]
    fn send_then_receive_round_trips() {
        static mut BUF: [u8; 12] = [0; 12];
        let mut k = TestKernel::new(TestBsp { switches: Cell::new(0) });
        let q = k.queue_create(unsafe { &mut *core::ptr::addr_of_mut!(BUF) }, 4).unwrap();
        k.current = Some(0);
        static mut STACK: [u32; 16] = [0; 16];
        let _t = k
            .task_create(1, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK) }, CreateFlags::empty())
            .unwrap();
        k.queue_send(q, &[1, 2, 3, 4], 0).unwrap();
        assert_eq!(k.queue_count(q).unwrap(), 1);
        let mut out = [0u8; 4];
        k.queue_receive(q, &mut out, 0).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(k.queue_count(q).unwrap(), 0);
    }

    #[test]
    fn receive_from_empty_with_zero_timeout_would_block() {
        static mut BUF: [u8; 4] = [0; 4];
        let mut k = TestKernel::new(TestBsp { switches: Cell::new(0) });
        let q = k.queue_create(unsafe { &mut *core::ptr::addr_of_mut!(BUF) }, 4).unwrap();
        k.current = Some(0);
        static mut STACK: [u32; 16] = [0; 16];
        let _t = k
            .task_create(1, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK) }, CreateFlags::empty())
            .unwrap();
        let mut out = [0u8; 4];
        assert_eq!(k.queue_receive(q, &mut out, 0), Err(Error::WouldBlock));
    }

    #[test]
    fn send_to_full_queue_with_zero_timeout_would_block() {
        static mut BUF: [u8; 4] = [0; 4];
        let mut k = TestKernel::new(TestBsp { switches: Cell::new(0) });
        let q = k.queue_create(unsafe { &mut *core::ptr::addr_of_mut!(BUF) }, 4).unwrap();
        k.current = Some(0);
        static mut STACK: [u32; 16] = [0; 16];
        let _t = k
            .task_create(1, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK) }, CreateFlags::empty())
            .unwrap();
        k.queue_send(q, &[9, 9, 9, 9], 0).unwrap();
        assert_eq!(k.queue_send(q, &[1, 1, 1, 1], 0), Err(Error::WouldBlock));
    }

    #[test]
    fn peek_does_not_remove() {
        static mut BUF: [u8; 4] = [0; 4];
        let mut k = TestKernel::new(TestBsp { switches: Cell::new(0) });
        let q = k.queue_create(unsafe { &mut *core::ptr::addr_of_mut!(BUF) }, 4).unwrap();
        k.current = Some(0);
        static mut STACK: [u32; 16] = [0; 16];
        let _t = k
            .task_create(1, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK) }, CreateFlags::empty())
            .unwrap();
        k.queue_send(q, &[5, 5, 5, 5], 0).unwrap();
        let mut out = [0u8; 4];
        k.queue_peek(q, &mut out).unwrap();
        assert_eq!(out, [5, 5, 5, 5]);
        assert_eq!(k.queue_count(q).unwrap(), 1);
    }
}
