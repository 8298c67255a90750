//! O(1) ready-set scheduling: one FIFO per priority level plus a bitmap
//! that finds the highest occupied level in constant time.
//!
//! A bitmap ready-queue can get the same bound by inserting an "imaginary"
//! entry for the current task and popping to decide whether to keep it or
//! switch — a trick needed when tasks are addressed by `'static` reference
//! and the queue itself owns no concept of "current". Here `Kernel::current`
//! already names the running task by index, so the
//! same bound falls out of simpler bookkeeping: the current task is simply
//! absent from every ready queue while it runs, and is reinserted at its
//! own priority's tail only when it is actually being preempted or is
//! voluntarily yielding — never on an ordinary `schedule()` call that finds
//! nothing better to run, which would otherwise incorrectly rotate it
//! behind same-priority peers.

use crate::bsp::Bsp;
use crate::kernel::Kernel;
use crate::task::State;

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
    /// Enqueue `idx` at the tail of its effective priority's ready queue and
    /// mark it `Ready`. Must be called inside the kernel critical section.
    pub(crate) fn make_ready(&mut self, idx: u16) {
        let prio = self.tasks[idx as usize].effective_priority as usize;
        self.tasks[idx as usize].state = State::Ready;
        self.ready_queues[prio].push_back(&mut self.tasks, idx, |t| &mut t.ready_link);
        self.ready_bitmap.set(prio);
    }

    /// Remove `idx` from its ready queue without changing `state`. Must be
    /// called inside the kernel critical section.
    pub(crate) fn remove_ready(&mut self, idx: u16) {
        let prio = self.tasks[idx as usize].effective_priority as usize;
        self.ready_queues[prio].remove(&mut self.tasks, idx, |t| &mut t.ready_link);
        if self.ready_queues[prio].is_empty() {
            self.ready_bitmap.clear(prio);
        }
    }

    /// Move a `Ready` task from `old_prio` to its (already updated)
    /// effective priority's queue, preserving FIFO order among peers.
    pub(crate) fn reorder_ready(&mut self, idx: u16, old_prio: u8) {
        let old_prio = old_prio as usize;
        let new_prio = self.tasks[idx as usize].effective_priority as usize;
        self.ready_queues[old_prio].remove(&mut self.tasks, idx, |t| &mut t.ready_link);
        if self.ready_queues[old_prio].is_empty() {
            self.ready_bitmap.clear(old_prio);
        }
        self.ready_queues[new_prio].push_back(&mut self.tasks, idx, |t| &mut t.ready_link);
        self.ready_bitmap.set(new_prio);
    }

    /// Head of the highest-priority non-empty ready queue, without dequeuing it.
    fn peek_highest(&self) -> Option<u16> {
        let prio = self.ready_bitmap.find_highest()?;
        self.ready_queues[prio].front()
    }

    fn dequeue_highest(&mut self) -> Option<u16> {
        let prio = self.ready_bitmap.find_highest()?;
        let idx = self.ready_queues[prio].pop_front(&mut self.tasks, |t| &mut t.ready_link)?;
        if self.ready_queues[prio].is_empty() {
            self.ready_bitmap.clear(prio);
        }
        Some(idx)
    }

    /// Reinsert the current task (if still `Ready`) at its own priority's
    /// tail, then dequeue whoever is now the highest-priority ready task.
    /// Used by both preemption and voluntary yield, the two cases where the
    /// current task legitimately gives up its "exempt from the queue" slot.
    fn rotate_and_dequeue(&mut self) -> Option<u16> {
        if let Some(prev) = self.current {
            if self.tasks[prev as usize].state == State::Ready {
                self.make_ready(prev);
            }
        }
        self.dequeue_highest()
    }

    fn commit_switch(&mut self, new_current: Option<u16>) {
        self.pending_outgoing = self.current;
        self.current = new_current;
    }

    fn request_switch(&mut self) {
        if self.is_in_isr() {
            self.reschedule_pending = true;
        } else {
            self.bsp.trigger_context_switch();
        }
    }

    /// Re-evaluate who should run and, if a strictly-higher-priority task is
    /// now ready, nothing was running before, or `current` itself just left
    /// the `Ready` state (blocked, delayed, suspended, deleted), commit the
    /// switch and ask the BSP to perform — or, from ISR context, defer — the
    /// actual register context switch.
    ///
    /// Called at the end of every kernel API that may change readiness.
    /// Bounded work regardless of task count: one bitmap search, one list
    /// pop, at most one list push.
    pub fn schedule(&mut self) {
        self.critical_enter();
        let switch = match self.current {
            None => self.peek_highest().is_some(),
            Some(cur) if self.tasks[cur as usize].state != State::Ready => true,
            Some(cur) => match self.peek_highest() {
                Some(candidate) => {
                    let cur_prio = self.tasks[cur as usize].effective_priority as usize;
                    let candidate_prio = self.tasks[candidate as usize].effective_priority as usize;
                    candidate_prio > cur_prio
                }
                None => false,
            },
        };
        if switch {
            let next = self.rotate_and_dequeue();
            self.commit_switch(next);
        }
        self.critical_exit();

        if switch {
            self.request_switch();
        }
    }

    /// First dispatch: pick the highest-priority ready task with no prior
    /// "current" to reinsert. Returns the stack pointer the BSP should load
    /// to begin thread-mode execution, or `None` if nothing is ready yet.
    pub fn kernel_start(&mut self) -> Option<usize> {
        self.critical_enter();
        let next = self.dequeue_highest();
        self.commit_switch(next);
        let sp = self.current.map(|idx| self.tasks[idx as usize].sp);
        self.critical_exit();
        sp
    }

    /// The BSP's context-switch exception handler calls this with the stack
    /// pointer it just saved for the outgoing task, and receives the stack
    /// pointer to restore for the new current task. This is the one seam
    /// where the kernel core hands off to hardware-specific register
    /// save/restore, matching the `context_switch_handler` BSP contract entry.
    pub fn context_switch_handler(&mut self, outgoing_sp: usize) -> usize {
        if let Some(prev) = self.pending_outgoing.take() {
            self.tasks[prev as usize].sp = outgoing_sp;
        }
        let cur = self.current.expect("context switch handler invoked with no current task");
        self.tasks[cur as usize].sp
    }

    /// Voluntarily give up the CPU. Rotates behind same-priority peers if
    /// any are ready; otherwise a no-op, since the current task is still the
    /// highest-priority ready task.
    pub fn task_yield(&mut self) {
        self.critical_enter();
        let next = self.rotate_and_dequeue();
        let switch = next != self.current;
        if switch {
            self.commit_switch(next);
        }
        self.critical_exit();
        if switch {
            self.request_switch();
        }
    }
}
