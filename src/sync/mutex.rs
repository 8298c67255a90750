//! Priority-inheritance mutex.
//!
//! Grounded in the ceiling-protocol shape of an owner-plus-wait-queue mutex
//! control block, but the locking algorithm itself is inheritance, not
//! ceiling — a waiter's priority is pushed onto the
//! owner, transitively across a chain of blocked owners, and withdrawn on
//! release rather than clamped to a static per-mutex value.
//!
//! A held mutex keeps no list of "who is waiting on whoever holds me" of
//! its own beyond `waiters`; restoring a released task's priority on
//! `give` is done by scanning the kernel's fixed-size mutex table for
//! `owner == self` rather than threading a second, TCB-resident list of
//! owned mutexes (see `DESIGN.md`).

use crate::bsp::Bsp;
use crate::error::{AssertCode, Error, Module, Result};
use crate::handle::{Handle, MutexId, INFINITE_TIMEOUT};
use crate::kernel::Kernel;
use crate::task::{State, WaitOn, WakeCause};
use crate::util::dlist::ListHead;

pub struct Mutex {
    pub(crate) in_use: bool,
    pub(crate) owner: Option<u16>,
    pub(crate) recursion: u16,
    pub(crate) waiters: ListHead,
}

impl Mutex {
    pub(crate) fn new() -> Self {
        Self {
            in_use: false,
            owner: None,
            recursion: 0,
            waiters: ListHead::EMPTY,
        }
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
    pub(crate) fn resolve_mutex(&self, id: MutexId) -> Result<u16> {
        let idx = id.index();
        if idx >= MUTEXES || !self.mutexes[idx].in_use {
            return Err(Error::Arg);
        }
        Ok(idx as u16)
    }

    pub fn mutex_create(&mut self) -> Result<MutexId> {
        self.critical_enter();
        let idx = self.mutexes.iter().position(|m| !m.in_use);
        if let Some(idx) = idx {
            self.mutexes[idx] = Mutex::new();
            self.mutexes[idx].in_use = true;
        }
        self.critical_exit();
        idx.map(|i| MutexId::from_index(i as u16)).ok_or(Error::Depleted)
    }

    /// Deletion is rejected while the mutex is owned or has waiters, rather
    /// than unblocking waiters with a flush error (see `DESIGN.md`).
    pub fn mutex_delete(&mut self, id: MutexId) -> Result<()> {
        let idx = self.resolve_mutex(id)?;
        self.critical_enter();
        let busy = self.mutexes[idx as usize].owner.is_some() || !self.mutexes[idx as usize].waiters.is_empty();
        if busy {
            self.critical_exit();
            return Err(Error::State);
        }
        self.mutexes[idx as usize].in_use = false;
        self.critical_exit();
        Ok(())
    }

    /// How many more times `mutex_give` must be called by the owner before
    /// the mutex is actually released. `0` if the mutex isn't owned.
    pub fn mutex_recursion(&self, id: MutexId) -> Result<u16> {
        let idx = self.resolve_mutex(id)?;
        Ok(self.mutexes[idx as usize].recursion)
    }

    pub fn mutex_owner(&self, id: MutexId) -> Result<Option<crate::handle::TaskId>> {
        let idx = self.resolve_mutex(id)?;
        Ok(self.mutexes[idx as usize].owner.map(crate::handle::TaskId::from_index))
    }

    /// Acquire `id`, waiting up to `timeout` ticks (`INFINITE_TIMEOUT` to
    /// wait forever, `NO_WAIT` to poll). Not ISR-safe — a mutex has an
    /// owning task by definition, and an ISR has none.
    pub fn mutex_take(&mut self, id: MutexId, timeout: u32) -> Result<()> {
        let idx = self.resolve_mutex(id)?;
        if self.is_in_isr() {
            return Err(Error::NotAllowed);
        }
        self.critical_enter();
        let cur = match self.current {
            Some(c) => c,
            None => {
                self.critical_exit();
                return Err(Error::State);
            }
        };

        match self.mutexes[idx as usize].owner {
            None => {
                self.mutexes[idx as usize].owner = Some(cur);
                self.mutexes[idx as usize].recursion = 1;
                self.critical_exit();
                return Ok(());
            }
            Some(owner) if owner == cur => {
                self.mutexes[idx as usize].recursion += 1;
                self.critical_exit();
                return Ok(());
            }
            Some(first_owner) => {
                if timeout == 0 {
                    self.critical_exit();
                    return Err(Error::WouldBlock);
                }
                let mut owner = first_owner;
                let caller_prio = self.tasks[cur as usize].effective_priority;
                let mut steps = 0usize;
                loop {
                    if self.tasks[owner as usize].effective_priority >= caller_prio {
                        break;
                    }
                    let old_prio = self.tasks[owner as usize].effective_priority;
                    self.tasks[owner as usize].effective_priority = caller_prio;
                    match self.tasks[owner as usize].state {
                        State::Ready => self.reorder_ready(owner, old_prio),
                        s if s.is_waiting() => self.reorder_wait_on(owner),
                        _ => {}
                    }
                    let next_owner = match self.tasks[owner as usize].wait_on {
                        WaitOn::Mutex(m2) => self.mutexes[m2 as usize].owner,
                        _ => None,
                    };
                    match next_owner {
                        Some(next) => {
                            owner = next;
                            steps += 1;
                            if steps > TASKS {
                                (self.assert_handler)(
                                    file!(),
                                    line!(),
                                    AssertCode { module: Module::Mutex, ordinal: 0, fatal: false },
                                );
                                self.critical_exit();
                                return Err(Error::Cycle);
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        self.tasks[cur as usize].state = State::WaitingMutex;
        self.tasks[cur as usize].wake_cause = WakeCause::None;
        let mut waiters = self.mutexes[idx as usize].waiters;
        self.wait_enqueue(&mut waiters, cur, WaitOn::Mutex(idx));
        self.mutexes[idx as usize].waiters = waiters;
        if timeout != INFINITE_TIMEOUT {
            self.delay_list_insert(cur, timeout);
        }
        self.critical_exit();
        self.schedule();

        match self.tasks[cur as usize].wake_cause {
            WakeCause::Timeout => Err(Error::Timeout),
            WakeCause::Cancel => Err(Error::Flush),
            _ => Ok(()),
        }
    }

    /// Try to acquire `id` without blocking.
    pub fn mutex_try_take(&mut self, id: MutexId) -> Result<()> {
        self.mutex_take(id, crate::handle::NO_WAIT)
    }

    /// Release a mutex owned by the caller. Restores the caller's effective
    /// priority to the max of its base priority and the highest-priority
    /// waiter of any other mutex it still owns, then grants ownership to
    /// the highest-priority waiter of `id`, if any.
    pub fn mutex_give(&mut self, id: MutexId) -> Result<()> {
        let idx = self.resolve_mutex(id)?;
        self.critical_enter();
        let cur = match self.current {
            Some(c) => c,
            None => {
                self.critical_exit();
                return Err(Error::State);
            }
        };
        if self.mutexes[idx as usize].owner != Some(cur) {
            self.critical_exit();
            return Err(Error::NotAllowed);
        }
        if self.mutexes[idx as usize].recursion > 1 {
            self.mutexes[idx as usize].recursion -= 1;
            self.critical_exit();
            return Ok(());
        }

        self.mutexes[idx as usize].owner = None;
        self.mutexes[idx as usize].recursion = 0;
        self.tasks[cur as usize].effective_priority = self.recompute_effective_priority(cur);

        let mut waiters = self.mutexes[idx as usize].waiters;
        let next_owner = waiters.pop_front(&mut self.tasks, |t| &mut t.wait_link);
        self.mutexes[idx as usize].waiters = waiters;

        if let Some(next) = next_owner {
            self.tasks[next as usize].wait_on = WaitOn::None;
            if self.tasks[next as usize].has_deadline {
                self.delay_list.remove(&mut self.tasks, next, |t| &mut t.delay_link);
                self.tasks[next as usize].has_deadline = false;
            }
            self.mutexes[idx as usize].owner = Some(next);
            self.mutexes[idx as usize].recursion = 1;
            self.tasks[next as usize].wake_cause = WakeCause::Event;
            if self.tasks[next as usize].suspend_pending {
                self.tasks[next as usize].suspend_pending = false;
                self.tasks[next as usize].state = State::Suspended;
            } else {
                self.make_ready(next);
            }
        }

        self.critical_exit();
        self.schedule();
        Ok(())
    }

    /// The priority `idx` should have given the mutexes it currently owns:
    /// its own base priority, raised to the highest-priority waiter of any
    /// mutex still in `owner == Some(idx)`.
    pub(crate) fn recompute_effective_priority(&self, idx: u16) -> u8 {
        let mut eff = self.tasks[idx as usize].base_priority;
        for m in self.mutexes.iter() {
            if m.owner == Some(idx) {
                if let Some(front) = m.waiters.front() {
                    let p = self.tasks[front as usize].effective_priority;
                    if p > eff {
                        eff = p;
                    }
                }
            }
        }
        eff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsp::Bsp;
    use crate::task::CreateFlags;

    struct TestBsp {
        switches: core::cell::Cell<u32>,
    }
    impl Bsp for TestBsp {
        fn irq_save_disable(&self) -> u32 {
            0
        }
        fn irq_restore(&self, _saved: u32) {}
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

    type TestKernel = Kernel<4, 8, 2, 0, 0, 0, 0, TestBsp>;

    fn entry(_arg: usize) {}

    #[test]
    fn priority_inheritance_raises_owner() {
        static mut STACK_LO: [u32; 16] = [0; 16];
        static mut STACK_HI: [u32; 16] = [0; 16];
        let mut k = TestKernel::new(TestBsp { switches: core::cell::Cell::new(0) });
        let low = k
            .task_create(1, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK_LO) }, CreateFlags::empty())
            .unwrap();
        let high = k
            .task_create(7, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK_HI) }, CreateFlags::empty())
            .unwrap();
        let m = k.mutex_create().unwrap();

        k.current = Some(0);
        k.mutex_take(m, INFINITE_TIMEOUT).unwrap();

        k.current = Some(1);
        k.task_set_priority(low, 1).unwrap();
        let _ = high;
        k.tasks[1].effective_priority = 7;
        // The blocking branch of `mutex_take` parks the caller and returns
        // only once something else sets `wake_cause`, which never happens
        // inside a single synchronous call here; what's verifiable in this
        // harness is the inheritance propagation that runs before the park.
        let _ = k.mutex_take(m, INFINITE_TIMEOUT);
        assert_eq!(k.tasks[0].effective_priority, 7);
    }

    #[test]
    fn recursive_take_requires_matching_gives() {
        static mut STACK: [u32; 16] = [0; 16];
        let mut k = TestKernel::new(TestBsp { switches: core::cell::Cell::new(0) });
        let t = k
            .task_create(1, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK) }, CreateFlags::empty())
            .unwrap();
        let _ = t;
        let m = k.mutex_create().unwrap();
        k.current = Some(0);
        k.mutex_take(m, INFINITE_TIMEOUT).unwrap();
        k.mutex_take(m, INFINITE_TIMEOUT).unwrap();
        assert_eq!(k.mutex_recursion(m).unwrap(), 2);
        k.mutex_give(m).unwrap();
        assert_eq!(k.mutex_owner(m).unwrap(), Some(crate::handle::TaskId::from_index(0)));
        k.mutex_give(m).unwrap();
        assert_eq!(k.mutex_owner(m).unwrap(), None);
    }

    #[test]
    fn give_by_non_owner_is_rejected() {
        static mut STACK: [u32; 16] = [0; 16];
        let mut k = TestKernel::new(TestBsp { switches: core::cell::Cell::new(0) });
        let _t = k
            .task_create(1, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK) }, CreateFlags::empty())
            .unwrap();
        let m = k.mutex_create().unwrap();
        k.current = Some(0);
        k.mutex_take(m, INFINITE_TIMEOUT).unwrap();
        k.current = Some(1);
        assert_eq!(k.mutex_give(m), Err(Error::NotAllowed));
    }
}
