//! Per-task signal bits, grounded in `aatasksignal.c`'s
//! `aaSignalWait`/`aaSignalSendPulse_`/`aaSignalClear`.
//!
//! Unlike mutex/semaphore/queue, a signal has no shared object table entry:
//! the 16 signal bits, the mask a task is waiting for, and the AND/OR mode
//! all live directly on the [`crate::task::Tcb`] of the task being signaled,
//! so `send`/`pulse` address a task, not a handle.

use crate::bsp::Bsp;
use crate::error::{Error, Result};
use crate::handle::{TaskId, INFINITE_TIMEOUT};
use crate::kernel::Kernel;
use crate::task::{State, WakeCause};

/// Whether `signal_wait` is satisfied by any one of the requested bits, or
/// only once every requested bit has arrived.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SignalMode {
    Or,
    And,
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
    /// Wait for some (`Or`) or all (`And`) of `sigs` to arrive, returning
    /// the bits that satisfied the wait. Signals already pending are
    /// consumed immediately without blocking. Not ISR-safe.
    pub fn signal_wait(&mut self, sigs: u16, mode: SignalMode, timeout: u32) -> Result<u16> {
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
        self.tasks[cur as usize].sig_and_mode = mode == SignalMode::And;
        self.tasks[cur as usize].sigs_wait = sigs;

        let mut got = sigs & self.tasks[cur as usize].sigs_recv;
        if self.tasks[cur as usize].sig_and_mode && got != sigs {
            got = 0;
        }
        if got != 0 {
            self.tasks[cur as usize].sigs_recv &= !got;
            self.critical_exit();
            return Ok(got);
        }

        if timeout == 0 {
            self.critical_exit();
            return Err(Error::WouldBlock);
        }

        self.remove_ready(cur);
        self.tasks[cur as usize].state = State::WaitingSignal;
        self.tasks[cur as usize].wake_cause = WakeCause::None;
        if timeout != INFINITE_TIMEOUT {
            self.delay_list_insert(cur, timeout);
        }
        self.critical_exit();
        self.schedule();

        match self.tasks[cur as usize].wake_cause {
            WakeCause::Timeout => Err(Error::Timeout),
            WakeCause::Cancel | WakeCause::Flush => Err(Error::Flush),
            _ => Ok(self.tasks[cur as usize].sig_wakeup),
        }
    }

    /// Shared implementation of `signal_send` (memorized) and
    /// `signal_pulse` (bits not memorized if not consumed immediately).
    fn signal_send_pulse(&mut self, id: TaskId, sigs: u16, pulse: bool) -> Result<()> {
        let idx = self.resolve_task(id)?;
        self.critical_enter();
        self.tasks[idx as usize].sigs_recv |= sigs;
        let mut wakeup = self.tasks[idx as usize].sigs_recv & self.tasks[idx as usize].sigs_wait;
        if pulse {
            self.tasks[idx as usize].sigs_recv &= !sigs;
        }

        if self.tasks[idx as usize].state == State::WaitingSignal {
            if self.tasks[idx as usize].sig_and_mode && wakeup != self.tasks[idx as usize].sigs_wait {
                wakeup = 0;
            }
            if wakeup != 0 {
                self.tasks[idx as usize].sig_wakeup = wakeup;
                self.tasks[idx as usize].sigs_recv &= !wakeup;
                if self.tasks[idx as usize].has_deadline {
                    self.delay_list.remove(&mut self.tasks, idx, |t| &mut t.delay_link);
                    self.tasks[idx as usize].has_deadline = false;
                }
                self.tasks[idx as usize].wake_cause = WakeCause::Event;
                if self.tasks[idx as usize].suspend_pending {
                    self.tasks[idx as usize].suspend_pending = false;
                    self.tasks[idx as usize].state = State::Suspended;
                } else {
                    self.make_ready(idx);
                }
            }
        }
        self.critical_exit();
        self.schedule();
        Ok(())
    }

    /// Memorized signal send: bits not consumed by a waiter stay set in
    /// the target's received-signal word for a later `signal_wait` to pick
    /// up immediately.
    pub fn signal_send(&mut self, id: TaskId, sigs: u16) -> Result<()> {
        self.signal_send_pulse(id, sigs, false)
    }

    /// Pulsed signal send: bits not consumed by a waiter right now are
    /// discarded rather than memorized.
    pub fn signal_pulse(&mut self, id: TaskId, sigs: u16) -> Result<()> {
        self.signal_send_pulse(id, sigs, true)
    }

    /// Clear bits in a task's received-signal word without waking it.
    pub fn signal_clear(&mut self, id: TaskId, sigs: u16) -> Result<()> {
        let idx = self.resolve_task(id)?;
        self.critical_enter();
        self.tasks[idx as usize].sigs_recv &= !sigs;
        self.critical_exit();
        Ok(())
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

    type TestKernel = Kernel<2, 4, 0, 0, 0, 0, 0, TestBsp>;

    fn entry(_arg: usize) {}

    #[test]
    fn pending_signal_is_consumed_without_blocking() {
        static mut STACK: [u32; 16] = [0; 16];
        let mut k = TestKernel::new(TestBsp { switches: Cell::new(0) });
        let t = k
            .task_create(1, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK) }, CreateFlags::empty())
            .unwrap();
        k.current = Some(0);
        k.signal_send(t, 0b010).unwrap();
        k.current = Some(1);
        let got = k.signal_wait(0b010, SignalMode::Or, 0).unwrap();
        assert_eq!(got, 0b010);
    }

    #[test]
    fn and_mode_requires_every_bit() {
        static mut STACK: [u32; 16] = [0; 16];
        let mut k = TestKernel::new(TestBsp { switches: Cell::new(0) });
        let t = k
            .task_create(1, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK) }, CreateFlags::empty())
            .unwrap();
        k.current = Some(0);
        k.signal_send(t, 0b001).unwrap();
        k.current = Some(1);
        assert_eq!(k.signal_wait(0b011, SignalMode::And, 0), Err(Error::WouldBlock));
        assert_eq!(k.tasks[1].sigs_recv, 0b001);
    }

    #[test]
    fn pulse_discards_unconsumed_bits() {
        static mut STACK: [u32; 16] = [0; 16];
        let mut k = TestKernel::new(TestBsp { switches: Cell::new(0) });
        let t = k
            .task_create(1, entry, 0, unsafe { &mut *core::ptr::addr_of_mut!(STACK) }, CreateFlags::empty())
            .unwrap();
        k.current = Some(0);
        k.signal_pulse(t, 0b100).unwrap();
        assert_eq!(k.tasks[1].sigs_recv, 0);
    }
}
