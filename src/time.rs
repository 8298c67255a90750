//! Tick counting and the kernel-wide delay list.
//!
//! A "frontier"/"headroom" pair lets time be adjusted backwards as well as
//! forwards, which this kernel's tick source never needs — ticks are
//! monotonic, and the delay list only has to tolerate the eventual
//! wraparound of a 32-bit counter. That's handled directly: every ordering
//! comparison works on `wake_tick.wrapping_sub(now)` reinterpreted as
//! signed, not on the raw absolute tick value, so a list built before a
//! wraparound stays correctly ordered after one.

use crate::bsp::Bsp;
use crate::error::{Error, Result};
use crate::handle::TaskId;
use crate::kernel::Kernel;
use crate::task::{State, WakeCause};

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
    /// Ticks elapsed since `kernel_init`, wrapping at 2^32. Callers compare
    /// two readings with wrapping subtraction, never with `<`/`>` directly.
    pub fn get_tick_count(&self) -> u32 {
        self.tick_count
    }

    /// Insert `idx` into the delay list so it wakes at `self.tick_count +
    /// ticks`, ordered so invariant 5 (non-decreasing wake order) holds no
    /// matter how many times `tick_count` has wrapped since other entries
    /// were inserted.
    pub(crate) fn delay_list_insert(&mut self, idx: u16, ticks: u32) {
        let now = self.tick_count;
        let wake = now.wrapping_add(ticks);
        self.tasks[idx as usize].wake_tick = wake;
        self.tasks[idx as usize].has_deadline = true;
        self.delay_list.insert_by_key(
            &mut self.tasks,
            idx,
            |t| &mut t.delay_link,
            |t| t.wake_tick.wrapping_sub(now),
            ticks,
        );
    }

    /// Suspend the calling task for `ticks` timer ticks. Not ISR-safe.
    pub fn delay(&mut self, ticks: u32) -> Result<()> {
        if self.is_in_isr() {
            return Err(Error::NotAllowed);
        }
        if ticks == 0 {
            self.task_yield();
            return Ok(());
        }
        self.critical_enter();
        let idx = match self.current {
            Some(idx) => idx,
            None => {
                self.critical_exit();
                return Err(Error::State);
            }
        };
        self.remove_ready(idx);
        self.tasks[idx as usize].state = State::Delayed;
        self.tasks[idx as usize].wake_cause = WakeCause::None;
        self.delay_list_insert(idx, ticks);
        self.critical_exit();
        self.schedule();

        match self.tasks[idx as usize].wake_cause {
            WakeCause::Cancel => Err(Error::Flush),
            _ => Ok(()),
        }
    }

    /// Common wakeup path for timeout, event satisfaction, and cancellation.
    /// Removes `idx` from the delay list and any object-wait list it
    /// belongs to (a task is on at most one of each), then either readies it
    /// or, if a suspend was requested while it was waiting, lands it on the
    /// suspended list instead.
    pub(crate) fn wake_task(&mut self, idx: u16, cause: WakeCause) {
        self.critical_enter();
        self.cancel_object_wait(idx);
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
        self.critical_exit();
    }

    /// Cancel any pending wait for `id`: removes it from the delay list and
    /// its object-wait list, marks it awakened-by-cancel, and readies it
    /// (or suspends it, per the same rule as any other wakeup).
    pub fn wake_up(&mut self, id: TaskId) -> Result<()> {
        let idx = self.resolve_task(id)?;
        let waiting = matches!(
            self.tasks[idx as usize].state,
            State::Delayed | State::WaitingMutex | State::WaitingSem | State::WaitingQueue | State::WaitingSignal | State::WaitingIo
        );
        if !waiting {
            return Err(Error::State);
        }
        self.wake_task(idx, WakeCause::Cancel);
        self.schedule();
        Ok(())
    }

    /// The periodic tick interrupt handler. Advances `tick_count`, wakes
    /// every task whose deadline has elapsed, and dispatches expired
    /// software timers, then requests a reschedule if warranted. Intended
    /// to be called by the BSP from the tick ISR; internally marks ISR
    /// context so any wakeup it causes defers the actual switch to
    /// `isr_exit`.
    pub fn tick(&mut self) {
        self.isr_enter();
        self.critical_enter();
        self.tick_count = self.tick_count.wrapping_add(1);
        let now = self.tick_count;
        while let Some(head) = self.delay_list.front() {
            let remaining = self.tasks[head as usize].wake_tick.wrapping_sub(now) as i32;
            if remaining > 0 {
                break;
            }
            self.delay_list.remove(&mut self.tasks, head, |t| &mut t.delay_link);
            self.tasks[head as usize].has_deadline = false;
            self.critical_exit();
            self.wake_task(head, WakeCause::Timeout);
            self.critical_enter();
        }
        self.dispatch_timers(now);
        self.critical_exit();
        self.schedule();
        self.isr_exit();
    }

    /// Tickless idle entry: program the tick source to fire no sooner than
    /// the next delay-list deadline (or not at all, if nothing is waiting)
    /// instead of at the next periodic boundary. Only meaningful once the
    /// BSP has actually stopped the periodic tick and entered a low-power
    /// wait.
    #[cfg(feature = "tickless")]
    pub fn idle_enter_tickless(&mut self) {
        self.critical_enter();
        let delta = match self.delay_list.front() {
            Some(head) => self.tasks[head as usize].wake_tick.wrapping_sub(self.tick_count).max(1),
            None => u32::MAX,
        };
        self.critical_exit();
        self.bsp.tick_stretch_until(delta);
    }

    /// Tickless idle exit: fold the BSP-reported elapsed ticks into
    /// `tick_count` in one step, then run the same delay/timer dispatch the
    /// periodic tick handler would have run incrementally.
    #[cfg(feature = "tickless")]
    pub fn idle_resume_tickless(&mut self, elapsed_ticks: u32) {
        self.critical_enter();
        self.tick_count = self.tick_count.wrapping_add(elapsed_ticks);
        let now = self.tick_count;
        while let Some(head) = self.delay_list.front() {
            let remaining = self.tasks[head as usize].wake_tick.wrapping_sub(now) as i32;
            if remaining > 0 {
                break;
            }
            self.delay_list.remove(&mut self.tasks, head, |t| &mut t.delay_link);
            self.tasks[head as usize].has_deadline = false;
            self.critical_exit();
            self.wake_task(head, WakeCause::Timeout);
            self.critical_enter();
        }
        self.dispatch_timers(now);
        self.critical_exit();
        self.schedule();
    }
}
