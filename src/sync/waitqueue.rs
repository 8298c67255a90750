//! Wait-list bookkeeping shared by every blocking object (mutex, semaphore,
//! queue, pool, signal).
//!
//! Each object owns its own [`ListHead`], threaded through `Tcb::wait_link`
//! and kept in descending-effective-priority order (ties FIFO) by
//! [`ListHead::insert_by_key_desc`] — the same ordering a wait queue can get
//! by walking back-to-front from the tail with a priority comparison; doing
//! it at insertion time here means waking is always just a `pop_front`.

use crate::bsp::Bsp;
use crate::kernel::Kernel;
use crate::task::{State, WaitOn, WakeCause};
use crate::util::dlist::ListHead;

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
    /// Park `idx` on `list` in priority order and record `wait_on` so it can
    /// be found again by `cancel_object_wait` on timeout, deletion, or
    /// explicit cancellation. Caller is responsible for setting `state` and,
    /// if timed, calling `delay_list_insert` as well.
    pub(crate) fn wait_enqueue(&mut self, list: &mut ListHead, idx: u16, wait_on: WaitOn) {
        let prio = self.tasks[idx as usize].effective_priority as u32;
        list.insert_by_key_desc(&mut self.tasks, idx, |t| &mut t.wait_link, |t| t.effective_priority as u32, prio);
        self.tasks[idx as usize].wait_on = wait_on;
    }

    /// Remove `idx` from whichever object-wait list it is recorded as
    /// belonging to, if any. A no-op for a task that isn't waiting on an
    /// object (e.g. a plain `delay`). Does not touch the delay list.
    pub(crate) fn cancel_object_wait(&mut self, idx: u16) {
        match self.tasks[idx as usize].wait_on {
            WaitOn::None => {}
            WaitOn::Mutex(m) => {
                self.mutexes[m as usize].waiters.remove(&mut self.tasks, idx, |t| &mut t.wait_link);
            }
            WaitOn::Sem(s) => {
                self.sems[s as usize].waiters.remove(&mut self.tasks, idx, |t| &mut t.wait_link);
            }
            WaitOn::QueueSend(q) => {
                self.queues[q as usize].send_waiters.remove(&mut self.tasks, idx, |t| &mut t.wait_link);
            }
            WaitOn::QueueRecv(q) => {
                self.queues[q as usize].recv_waiters.remove(&mut self.tasks, idx, |t| &mut t.wait_link);
            }
            WaitOn::Pool(p) => {
                self.pools[p as usize].waiters.remove(&mut self.tasks, idx, |t| &mut t.wait_link);
            }
        }
        self.tasks[idx as usize].wait_on = WaitOn::None;
    }

    /// Reposition `idx` within the object-wait list it currently occupies,
    /// after its effective priority has changed (priority inheritance
    /// pushed onto a task that is itself blocked on another mutex). A
    /// no-op if `idx` isn't on an object-wait list.
    pub(crate) fn reorder_wait_on(&mut self, idx: u16) {
        let prio = self.tasks[idx as usize].effective_priority as u32;
        macro_rules! reposition {
            ($list:expr) => {{
                $list.remove(&mut self.tasks, idx, |t| &mut t.wait_link);
                $list.insert_by_key_desc(&mut self.tasks, idx, |t| &mut t.wait_link, |t| t.effective_priority as u32, prio);
            }};
        }
        match self.tasks[idx as usize].wait_on {
            WaitOn::None => {}
            WaitOn::Mutex(m) => reposition!(self.mutexes[m as usize].waiters),
            WaitOn::Sem(s) => reposition!(self.sems[s as usize].waiters),
            WaitOn::QueueSend(q) => reposition!(self.queues[q as usize].send_waiters),
            WaitOn::QueueRecv(q) => reposition!(self.queues[q as usize].recv_waiters),
            WaitOn::Pool(p) => reposition!(self.pools[p as usize].waiters),
        }
    }

    /// Pop the highest-priority waiter off `list` (if any) and wake it with
    /// `cause`, honoring a pending suspend request the same way
    /// `time::wake_task` does. Must be called inside the kernel critical
    /// section. Returns the woken task's index.
    pub(crate) fn wake_one(&mut self, list: &mut ListHead, cause: WakeCause) -> Option<u16> {
        let idx = list.pop_front(&mut self.tasks, |t| &mut t.wait_link)?;
        self.tasks[idx as usize].wait_on = WaitOn::None;
        if self.tasks[idx as usize].has_deadline {
            self.delay_list.remove(&mut self.tasks, idx, |t| &mut t.delay_link);
            self.tasks[idx as usize].has_deadline = false;
        }
        self.tasks[idx as usize].wake_cause = cause;
        if self.tasks[idx as usize].suspend_pending {
            self.tasks[idx as usize].suspend_pending = false;
            self.tasks[idx as usize].state = State::Suspended;
        } else {
            self.make_ready(idx);
        }
        Some(idx)
    }

    /// Wake every waiter on `list` with `cause` (used by `flush`/`reset`
    /// operations that empty a wait list all at once).
    pub(crate) fn wake_all(&mut self, list: &mut ListHead, cause: WakeCause) -> u32 {
        let mut n = 0;
        while self.wake_one(list, cause).is_some() {
            n += 1;
        }
        n
    }
}
