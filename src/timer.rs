//! Software timers: one list ordered by absolute fire tick, matching the
//! shape of `r3_kernel::timer`'s `TimerCb` (attr + period + linked timeout)
//! but collapsed to this crate's index-based, non-generic kernel.
//!
//! A timer's callback never runs from `tick()` itself — `tick` only moves
//! expired entries onto a FIFO "due" list and wakes the timer-service task,
//! so a dedicated timer-service context lets a callback use any blocking
//! primitive. [`Kernel::timer_service_run`] is the loop body that task is
//! expected to call repeatedly.

use crate::bsp::Bsp;
use crate::error::{Error, Result};
use crate::handle::{Handle, TaskId, TimerId};
use crate::kernel::Kernel;
use crate::sync::signal::SignalMode;
use crate::util::dlist::Link;

/// Signal bit the timer-service task waits on; chosen distinct from bit 15,
/// reserved for driver I/O signaling.
pub const TIMER_SERVICE_SIGNAL: u16 = 1 << 14;

pub struct Timer {
    pub(crate) in_use: bool,
    running: bool,
    period: u32,
    fire_tick: u32,
    callback: fn(usize),
    arg: usize,
    link: Link,
    due_link: Link,
}

impl Timer {
    pub(crate) fn new() -> Self {
        Self {
            in_use: false,
            running: false,
            period: 0,
            fire_tick: 0,
            callback: |_| {},
            arg: 0,
            link: Link::UNLINKED,
            due_link: Link::UNLINKED,
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
    pub(crate) fn resolve_timer(&self, id: TimerId) -> Result<u16> {
        let idx = id.index();
        if idx >= TIMERS || !self.timers[idx].in_use {
            return Err(Error::Arg);
        }
        Ok(idx as u16)
    }

    /// Designate the task that runs timer callbacks. Must be called once,
    /// before the first `tick`, from the task that will loop on
    /// [`Kernel::timer_service_run`].
    pub fn set_timer_service_task(&mut self, id: TaskId) -> Result<()> {
        let idx = self.resolve_task(id)?;
        self.timer_service_task = Some(idx);
        Ok(())
    }

    /// Create a dormant timer. `period` of 0 means one-shot; otherwise the
    /// timer rearms itself for another `period` ticks each time it fires.
    pub fn timer_create(&mut self, callback: fn(usize), arg: usize, period: u32) -> Result<TimerId> {
        self.critical_enter();
        let idx = self.timers.iter().position(|t| !t.in_use);
        if let Some(idx) = idx {
            self.timers[idx] = Timer::new();
            self.timers[idx].in_use = true;
            self.timers[idx].callback = callback;
            self.timers[idx].arg = arg;
            self.timers[idx].period = period;
        }
        self.critical_exit();
        idx.map(|i| TimerId::from_index(i as u16)).ok_or(Error::Depleted)
    }

    pub fn timer_delete(&mut self, id: TimerId) -> Result<()> {
        let idx = self.resolve_timer(id)?;
        self.critical_enter();
        if self.timers[idx as usize].running {
            self.timer_list.remove(&mut self.timers, idx, |t| &mut t.link);
        }
        self.timers[idx as usize].in_use = false;
        self.critical_exit();
        Ok(())
    }

    /// Arm the timer to first fire `delay` ticks from now. A no-op if
    /// already running.
    pub fn timer_start(&mut self, id: TimerId, delay: u32) -> Result<()> {
        let idx = self.resolve_timer(id)?;
        self.critical_enter();
        if self.timers[idx as usize].running {
            self.critical_exit();
            return Ok(());
        }
        let now = self.tick_count;
        self.timers[idx as usize].fire_tick = now.wrapping_add(delay);
        self.timers[idx as usize].running = true;
        self.timer_list.insert_by_key(
            &mut self.timers,
            idx,
            |t| &mut t.link,
            |t| t.fire_tick.wrapping_sub(now),
            delay,
        );
        self.critical_exit();
        Ok(())
    }

    /// Disarm the timer. A no-op if already stopped.
    pub fn timer_stop(&mut self, id: TimerId) -> Result<()> {
        let idx = self.resolve_timer(id)?;
        self.critical_enter();
        if self.timers[idx as usize].running {
            self.timer_list.remove(&mut self.timers, idx, |t| &mut t.link);
            self.timers[idx as usize].running = false;
        }
        self.critical_exit();
        Ok(())
    }

    /// Change the timer's delay and period, rearming it from now regardless
    /// of whether it was previously running ("setting rearms it").
    pub fn timer_set(&mut self, id: TimerId, delay: u32, period: u32) -> Result<()> {
        let idx = self.resolve_timer(id)?;
        self.critical_enter();
        if self.timers[idx as usize].running {
            self.timer_list.remove(&mut self.timers, idx, |t| &mut t.link);
        }
        let now = self.tick_count;
        self.timers[idx as usize].period = period;
        self.timers[idx as usize].fire_tick = now.wrapping_add(delay);
        self.timers[idx as usize].running = true;
        self.timer_list.insert_by_key(
            &mut self.timers,
            idx,
            |t| &mut t.link,
            |t| t.fire_tick.wrapping_sub(now),
            delay,
        );
        self.critical_exit();
        Ok(())
    }

    /// Move every timer due at or before `now` onto the due list, rearming
    /// periodic ones in place, and wake the timer-service task if anything
    /// became due. Must be called inside the kernel critical section;
    /// called from `time::tick` and the tickless idle-resume path.
    pub(crate) fn dispatch_timers(&mut self, now: u32) {
        let mut any_due = false;
        while let Some(head) = self.timer_list.front() {
            let remaining = self.timers[head as usize].fire_tick.wrapping_sub(now) as i32;
            if remaining > 0 {
                break;
            }
            self.timer_list.remove(&mut self.timers, head, |t| &mut t.link);
            let period = self.timers[head as usize].period;
            if period != 0 {
                self.timers[head as usize].fire_tick = self.timers[head as usize].fire_tick.wrapping_add(period);
                let delay = self.timers[head as usize].fire_tick.wrapping_sub(now);
                self.timer_list.insert_by_key(
                    &mut self.timers,
                    head,
                    |t| &mut t.link,
                    |t| t.fire_tick.wrapping_sub(now),
                    delay,
                );
            } else {
                self.timers[head as usize].running = false;
            }
            self.timer_due.push_back(&mut self.timers, head, |t| &mut t.due_link);
            any_due = true;
        }
        if any_due {
            if let Some(task) = self.timer_service_task {
                let _ = self.signal_send(TaskId::from_index(task), TIMER_SERVICE_SIGNAL);
            }
        }
    }

    /// Run every currently-due timer callback, outside the kernel critical
    /// section so a callback may itself call a blocking primitive. Intended
    /// to be called in a loop, guarded by a wait on
    /// [`TIMER_SERVICE_SIGNAL`], from the task named in
    /// [`Kernel::set_timer_service_task`].
    pub fn timer_service_run(&mut self) {
        loop {
            self.critical_enter();
            let head = self.timer_due.pop_front(&mut self.timers, |t| &mut t.due_link);
            self.critical_exit();
            let idx = match head {
                Some(idx) => idx,
                None => break,
            };
            let (callback, arg) = (self.timers[idx as usize].callback, self.timers[idx as usize].arg);
            callback(arg);
        }
    }

    /// Block until timers are due, then run them; the loop body a
    /// timer-service task is expected to call forever.
    pub fn timer_service_wait_and_run(&mut self, timeout: u32) -> Result<()> {
        match self.signal_wait(TIMER_SERVICE_SIGNAL, SignalMode::Or, timeout) {
            Ok(_) => {
                self.timer_service_run();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CreateFlags;
    use core::cell::Cell;
    use core::sync::atomic::{AtomicU32, Ordering};

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

    type TestKernel = Kernel<2, 4, 0, 0, 0, 2, 0, TestBsp>;

    fn entry(_arg: usize) {}

    static FIRE_COUNT: AtomicU32 = AtomicU32::new(0);
    fn on_fire(_arg: usize) {
        FIRE_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn one_shot_timer_fires_once_and_disarms() {
        FIRE_COUNT.store(0, Ordering::Relaxed);
        static mut STACK: [u32; 16] = [0; 16];
        let mut k = TestKernel::new(TestBsp { switches: Cell::new(0) });
        let svc = k
            .task_create(1, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK) }, CreateFlags::empty())
            .unwrap();
        k.set_timer_service_task(svc).unwrap();
        let t = k.timer_create(on_fire, 0, 0).unwrap();
        k.timer_start(t, 5).unwrap();
        k.current = Some(0);
        for _ in 0..5 {
            k.tick();
        }
        k.timer_service_run();
        assert_eq!(FIRE_COUNT.load(Ordering::Relaxed), 1);
        assert!(!k.timers[t.index()].running);
    }

    #[test]
    fn periodic_timer_rearms_itself() {
        FIRE_COUNT.store(0, Ordering::Relaxed);
        static mut STACK: [u32; 16] = [0; 16];
        let mut k = TestKernel::new(TestBsp { switches: Cell::new(0) });
        let svc = k
            .task_create(1, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK) }, CreateFlags::empty())
            .unwrap();
        k.set_timer_service_task(svc).unwrap();
        let t = k.timer_create(on_fire, 0, 3).unwrap();
        k.timer_start(t, 3).unwrap();
        for _ in 0..9 {
            k.tick();
            k.timer_service_run();
        }
        assert_eq!(FIRE_COUNT.load(Ordering::Relaxed), 3);
        assert!(k.timers[t.index()].running);
    }

    #[test]
    fn stop_removes_from_list() {
        static mut STACK: [u32; 16] = [0; 16];
        let mut k = TestKernel::new(TestBsp { switches: Cell::new(0) });
        let svc = k
            .task_create(1, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK) }, CreateFlags::empty())
            .unwrap();
        k.set_timer_service_task(svc).unwrap();
        let t = k.timer_create(on_fire, 0, 0).unwrap();
        k.timer_start(t, 10).unwrap();
        k.timer_stop(t).unwrap();
        assert!(k.timer_list.is_empty());
    }
}
