//! Counting semaphore with a signed count, the way `aaSemCreate`/
//! `aaSemTake`/`aaSemGive` model it: a negative count's magnitude is
//! exactly the number of queued waiters, so `take`/`give` never need to
//! consult the wait list length separately.

use crate::bsp::Bsp;
use crate::error::{Error, Result};
use crate::handle::{Handle, SemId, INFINITE_TIMEOUT};
use crate::kernel::Kernel;
use crate::task::{State, WaitOn, WakeCause};
use crate::util::dlist::ListHead;

pub struct Semaphore {
    pub(crate) in_use: bool,
    pub(crate) count: i32,
    pub(crate) waiters: ListHead,
}

impl Semaphore {
    pub(crate) fn new() -> Self {
        Self {
            in_use: false,
            count: 0,
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
    pub(crate) fn resolve_sem(&self, id: SemId) -> Result<u16> {
        let idx = id.index();
        if idx >= SEMS || !self.sems[idx].in_use {
            return Err(Error::Arg);
        }
        Ok(idx as u16)
    }

    pub fn sem_create(&mut self, initial_count: i32) -> Result<SemId> {
        self.critical_enter();
        let idx = self.sems.iter().position(|s| !s.in_use);
        if let Some(idx) = idx {
            self.sems[idx] = Semaphore::new();
            self.sems[idx].in_use = true;
            self.sems[idx].count = initial_count;
        }
        self.critical_exit();
        idx.map(|i| SemId::from_index(i as u16)).ok_or(Error::Depleted)
    }

    pub fn sem_delete(&mut self, id: SemId) -> Result<()> {
        let idx = self.resolve_sem(id)?;
        self.critical_enter();
        if !self.sems[idx as usize].waiters.is_empty() {
            self.critical_exit();
            return Err(Error::State);
        }
        self.sems[idx as usize].in_use = false;
        self.critical_exit();
        Ok(())
    }

    pub fn sem_count(&self, id: SemId) -> Result<i32> {
        let idx = self.resolve_sem(id)?;
        Ok(self.sems[idx as usize].count)
    }

    /// Decrement the count, waiting up to `timeout` ticks if it goes
    /// negative. Not ISR-safe (an ISR cannot block).
    pub fn sem_take(&mut self, id: SemId, timeout: u32) -> Result<()> {
        let idx = self.resolve_sem(id)?;
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
        self.sems[idx as usize].count -= 1;
        if self.sems[idx as usize].count >= 0 {
            self.critical_exit();
            return Ok(());
        }
        if timeout == 0 {
            self.sems[idx as usize].count += 1;
            self.critical_exit();
            return Err(Error::WouldBlock);
        }

        self.tasks[cur as usize].state = State::WaitingSem;
        self.tasks[cur as usize].wake_cause = WakeCause::None;
        let mut waiters = self.sems[idx as usize].waiters;
        self.wait_enqueue(&mut waiters, cur, WaitOn::Sem(idx));
        self.sems[idx as usize].waiters = waiters;
        if timeout != INFINITE_TIMEOUT {
            self.delay_list_insert(cur, timeout);
        }
        self.critical_exit();
        self.schedule();

        match self.tasks[cur as usize].wake_cause {
            WakeCause::Timeout => Err(Error::Timeout),
            WakeCause::Cancel | WakeCause::Flush => Err(Error::Flush),
            _ => Ok(()),
        }
    }

    /// Increment the count, waking the highest-priority waiter if the count
    /// was non-positive. ISR-safe.
    pub fn sem_give(&mut self, id: SemId) -> Result<()> {
        let idx = self.resolve_sem(id)?;
        self.critical_enter();
        self.sems[idx as usize].count += 1;
        if self.sems[idx as usize].count <= 0 {
            let mut waiters = self.sems[idx as usize].waiters;
            self.wake_one(&mut waiters, WakeCause::Event);
            self.sems[idx as usize].waiters = waiters;
        }
        self.critical_exit();
        self.schedule();
        Ok(())
    }

    /// Wake every waiter with `Error::Flush` and restore the count to the
    /// number of waiters actually woken (a negative count's magnitude is
    /// always exactly the waiter count, so this brings it back to zero).
    pub fn sem_flush(&mut self, id: SemId) -> Result<()> {
        let idx = self.resolve_sem(id)?;
        self.critical_enter();
        let mut waiters = self.sems[idx as usize].waiters;
        let n = self.wake_all(&mut waiters, WakeCause::Flush);
        self.sems[idx as usize].waiters = waiters;
        self.sems[idx as usize].count += n as i32;
        self.critical_exit();
        self.schedule();
        Ok(())
    }

    /// Set the count to `n`. Rejected while waiters are queued, since a
    /// negative-count invariant would otherwise desync from the actual
    /// waiter list length.
    pub fn sem_reset(&mut self, id: SemId, n: i32) -> Result<()> {
        let idx = self.resolve_sem(id)?;
        self.critical_enter();
        if !self.sems[idx as usize].waiters.is_empty() {
            self.critical_exit();
            return Err(Error::State);
        }
        self.sems[idx as usize].count = n;
        self.critical_exit();
        Ok(())
    }
}
