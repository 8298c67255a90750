//! Task control blocks and task lifecycle operations.

use crate::bsp::Bsp;
use crate::error::{Error, Result};
use crate::handle::{Handle, TaskId};
use crate::kernel::{Event, Kernel};
use crate::util::dlist::Link;
use bitflags::bitflags;

/// Where a task currently sits relative to the scheduler.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    /// Table slot is free.
    None,
    Ready,
    Delayed,
    Suspended,
    WaitingMutex,
    WaitingSem,
    WaitingSignal,
    WaitingQueue,
    WaitingIo,
}

impl State {
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            State::WaitingMutex | State::WaitingSem | State::WaitingSignal | State::WaitingQueue | State::WaitingIo
        )
    }
}

/// What caused a blocked task to become ready again.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WakeCause {
    None,
    /// A mutex, semaphore, queue, signal, or pool satisfied the wait.
    Event,
    /// The delay-list deadline elapsed.
    Timeout,
    /// An explicit `wake_up` cancelled the wait.
    Cancel,
    /// `flush` forced every waiter out.
    Flush,
}

bitflags! {
    pub struct CreateFlags: u8 {
        /// Place the new task on the suspended list instead of making it ready.
        const SUSPENDED = 0b0000_0001;
    }
}

/// Which object table (if any) a blocked task's `wait_link` currently
/// belongs to, so it can be found and removed again on timeout,
/// cancellation, or deletion without the object needing its own reverse map.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum WaitOn {
    None,
    Mutex(u16),
    Sem(u16),
    QueueSend(u16),
    QueueRecv(u16),
    Pool(u16),
}

const GUARD_WORD: u32 = 0xDEAD_C0DE;

/// One schedulable unit. Lives in [`Kernel`]'s fixed-size task table;
/// referenced everywhere else by index, never by pointer.
pub struct Tcb {
    pub(crate) state: State,
    pub(crate) base_priority: u8,
    pub(crate) effective_priority: u8,
    pub(crate) suspend_pending: bool,

    pub(crate) entry: Option<fn(usize)>,
    pub(crate) arg: usize,
    pub(crate) sp: usize,
    stack_ptr: *mut u32,
    stack_words: usize,
    overflowed: bool,

    pub(crate) ready_link: Link,
    pub(crate) delay_link: Link,
    pub(crate) wait_link: Link,
    pub(crate) delete_link: Link,

    pub(crate) wake_tick: u32,
    pub(crate) has_deadline: bool,
    pub(crate) wake_cause: WakeCause,
    pub(crate) wait_on: WaitOn,

    pub(crate) sigs_recv: u16,
    pub(crate) sigs_wait: u16,
    pub(crate) sig_and_mode: bool,
    pub(crate) sig_wakeup: u16,

    pub(crate) cpu_usage: u32,
}

// SAFETY: `stack_ptr` addresses a `'static` buffer handed to `task_create`
// by the caller, who guarantees exclusive ownership passes to the kernel;
// the kernel never aliases it outside of `Tcb`'s own methods.
unsafe impl Send for Tcb {}

impl Tcb {
    pub(crate) fn new() -> Self {
        Self {
            state: State::None,
            base_priority: 0,
            effective_priority: 0,
            suspend_pending: false,
            entry: None,
            arg: 0,
            sp: 0,
            stack_ptr: core::ptr::null_mut(),
            stack_words: 0,
            overflowed: false,
            ready_link: Link::UNLINKED,
            delay_link: Link::UNLINKED,
            wait_link: Link::UNLINKED,
            delete_link: Link::UNLINKED,
            wake_tick: 0,
            has_deadline: false,
            wake_cause: WakeCause::None,
            wait_on: WaitOn::None,
            sigs_recv: 0,
            sigs_wait: 0,
            sig_and_mode: false,
            sig_wakeup: 0,
            cpu_usage: 0,
        }
    }

    pub(crate) fn in_use(&self) -> bool {
        self.state != State::None
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
    /// Create a task. `stack` must be word-aligned; its first word becomes a
    /// guard word checked by [`Kernel::task_check_stack`], so the usable
    /// stack is `stack.len() - 1` words.
    pub fn task_create(
        &mut self,
        priority: u8,
        entry: fn(usize),
        arg: usize,
        stack: &'static mut [u32],
        flags: CreateFlags,
    ) -> Result<TaskId> {
        if priority as usize >= PRIORITIES {
            return Err(Error::Arg);
        }
        const MIN_STACK_WORDS: usize = 16;
        if stack.len() < MIN_STACK_WORDS {
            return Err(Error::Arg);
        }

        let idx = self
            .tasks
            .iter()
            .position(|t| !t.in_use())
            .ok_or(Error::Depleted)?;

        let stack_words = stack.len();
        let stack_ptr = stack.as_mut_ptr();
        stack[0] = GUARD_WORD;
        if let Some(pattern) = self.stack_fill {
            for word in &mut stack[1..] {
                *word = pattern;
            }
        }
        // SAFETY: `stack_ptr` and `stack_words` describe exactly the buffer
        // we just initialized above.
        let top_addr = unsafe { stack_ptr.add(stack_words) } as usize;

        let suspended = flags.contains(CreateFlags::SUSPENDED);
        let tcb = &mut self.tasks[idx];
        *tcb = Tcb::new();
        tcb.state = if suspended { State::Suspended } else { State::Ready };
        tcb.base_priority = priority;
        tcb.effective_priority = priority;
        tcb.entry = Some(entry);
        tcb.arg = arg;
        tcb.sp = top_addr;
        tcb.stack_ptr = stack_ptr;
        tcb.stack_words = stack_words;

        if !suspended {
            self.critical_enter();
            self.make_ready(idx as u16);
            self.critical_exit();
            self.schedule();
        }

        Ok(TaskId::from_index(idx as u16))
    }

    /// Delete a task. Deleting the calling task defers stack reclamation to
    /// the idle task via [`Kernel::idle_process_deletions`], since a task
    /// cannot safely free the stack it is still running on.
    pub fn task_delete(&mut self, id: TaskId) -> Result<()> {
        let idx = self.resolve_task(id)?;
        self.critical_enter();
        self.unlink_task_from_all_lists(idx);

        if Some(idx) == self.current {
            self.tasks[idx as usize].state = State::None;
            self.to_delete.push_back(&mut self.tasks, idx, |t| &mut t.delete_link);
            self.critical_exit();
            self.schedule();
            return Ok(());
        }

        let (ptr, words) = {
            let tcb = &self.tasks[idx as usize];
            (tcb.stack_ptr, tcb.stack_words)
        };
        self.tasks[idx as usize] = Tcb::new();
        self.critical_exit();
        if !ptr.is_null() {
            (self.release_stack)(ptr as *mut u8, words * core::mem::size_of::<u32>());
        }
        Ok(())
    }

    /// Unlink `idx` from whichever single state-primary list and at most one
    /// object-wait list it currently occupies.
    pub(crate) fn unlink_task_from_all_lists(&mut self, idx: u16) {
        match self.tasks[idx as usize].state {
            State::Ready => self.remove_ready(idx),
            State::Delayed | State::Suspended => {}
            _ => {}
        }
        if self.tasks[idx as usize].has_deadline {
            self.delay_list.remove(&mut self.tasks, idx, |t| &mut t.delay_link);
            self.tasks[idx as usize].has_deadline = false;
        }
        self.cancel_object_wait(idx);
    }

    /// Called from the idle task. Finishes deferred self-deletions by
    /// returning each stack buffer through `release_stack`.
    pub fn idle_process_deletions(&mut self) {
        loop {
            self.critical_enter();
            let idx = self.to_delete.pop_front(&mut self.tasks, |t| &mut t.delete_link);
            self.critical_exit();
            let Some(idx) = idx else { break };
            let (ptr, words) = {
                let tcb = &self.tasks[idx as usize];
                (tcb.stack_ptr, tcb.stack_words)
            };
            self.tasks[idx as usize] = Tcb::new();
            if !ptr.is_null() {
                (self.release_stack)(ptr as *mut u8, words * core::mem::size_of::<u32>());
            }
        }
    }

    pub fn task_get_base_priority(&self, id: TaskId) -> Result<u8> {
        let idx = self.resolve_task(id)?;
        Ok(self.tasks[idx as usize].base_priority)
    }

    pub fn task_get_real_priority(&self, id: TaskId) -> Result<u8> {
        let idx = self.resolve_task(id)?;
        Ok(self.tasks[idx as usize].effective_priority)
    }

    pub fn task_get_state(&self, id: TaskId) -> Result<State> {
        let idx = self.resolve_task(id)?;
        Ok(self.tasks[idx as usize].state)
    }

    /// Suspend a task. A task that is currently `Ready` is pulled off the
    /// ready queue and parked directly; a task that is `Delayed` or waiting
    /// on an object keeps waiting, but is diverted to `Suspended` instead of
    /// `Ready` the moment that wait ends (see `time::wake_task`). Suspending
    /// an already-suspended task is a no-op; a task that is neither ready,
    /// delayed, waiting, nor suspended (i.e. deleted) is `Error::Arg`.
    pub fn task_suspend(&mut self, id: TaskId) -> Result<()> {
        let idx = self.resolve_task(id)?;
        self.critical_enter();
        let result = match self.tasks[idx as usize].state {
            State::Ready => {
                self.remove_ready(idx);
                self.tasks[idx as usize].state = State::Suspended;
                Ok(())
            }
            State::Delayed => {
                self.tasks[idx as usize].suspend_pending = true;
                Ok(())
            }
            State::WaitingMutex
            | State::WaitingSem
            | State::WaitingSignal
            | State::WaitingQueue
            | State::WaitingIo => {
                self.tasks[idx as usize].suspend_pending = true;
                Ok(())
            }
            State::Suspended => Ok(()),
            State::None => Err(Error::Arg),
        };
        self.critical_exit();
        if Some(idx) == self.current {
            self.schedule();
        }
        result
    }

    /// Resume a suspended task. If it is `Suspended` outright it becomes
    /// `Ready`; if a suspend was merely pending against a task still in a
    /// timed wait, the pending flag is cleared and the wait continues
    /// unaffected. A task that is not suspended and has no pending suspend
    /// request is left untouched (not an error, per the mutex/semaphore
    /// idiom of idempotent releases).
    pub fn task_resume(&mut self, id: TaskId) -> Result<()> {
        let idx = self.resolve_task(id)?;
        self.critical_enter();
        match self.tasks[idx as usize].state {
            State::Suspended => {
                self.tasks[idx as usize].suspend_pending = false;
                self.make_ready(idx);
            }
            State::None => {
                self.critical_exit();
                return Err(Error::Arg);
            }
            _ => {
                self.tasks[idx as usize].suspend_pending = false;
            }
        }
        self.critical_exit();
        self.schedule();
        Ok(())
    }

    /// Atomically read and zero every task's CPU-usage counter. `out[i]`
    /// receives the pre-reset counter for task-table slot `i`; slots beyond
    /// `out.len()` are still reset, just not reported.
    pub fn task_stat_clear(&mut self, out: &mut [u32]) {
        self.critical_enter();
        for (i, t) in self.tasks.iter_mut().enumerate() {
            if let Some(slot) = out.get_mut(i) {
                *slot = t.cpu_usage;
            }
            t.cpu_usage = 0;
        }
        self.critical_exit();
    }

    /// Change a task's configured (base) priority.
    ///
    /// If the task's effective priority is not currently elevated by
    /// priority inheritance, the new priority takes effect immediately and
    /// the task is re-homed in the ready set; otherwise the change is
    /// recorded and takes effect the next time the task's inherited
    /// priority is recomputed (mutex release — see `sync::mutex::give`).
    pub fn task_set_priority(&mut self, id: TaskId, new_base: u8) -> Result<()> {
        if new_base as usize >= PRIORITIES {
            return Err(Error::Arg);
        }
        let idx = self.resolve_task(id)?;
        self.critical_enter();
        let inherited = self.tasks[idx as usize].effective_priority != self.tasks[idx as usize].base_priority;
        self.tasks[idx as usize].base_priority = new_base;
        if !inherited {
            let old_eff = self.tasks[idx as usize].effective_priority;
            self.tasks[idx as usize].effective_priority = new_base;
            if self.tasks[idx as usize].state == State::Ready && old_eff != new_base {
                self.reorder_ready(idx, old_eff);
            }
        }
        self.critical_exit();
        self.schedule();
        Ok(())
    }

    /// Scan a task's unused stack region for the fill pattern, reporting how
    /// many free words remain and raising [`Event::StackThreshold`] /
    /// [`Event::StackOverflow`] as appropriate. Returns the free-word count.
    pub fn task_check_stack(&mut self, id: TaskId) -> Result<usize> {
        let idx = self.resolve_task(id)?;
        let (ptr, words, pattern) = {
            let tcb = &self.tasks[idx as usize];
            (tcb.stack_ptr, tcb.stack_words, self.stack_fill)
        };
        if ptr.is_null() {
            return Err(Error::State);
        }
        // SAFETY: `ptr`/`words` were recorded verbatim from the buffer given
        // to `task_create` and are never freed while the slot is in use.
        let region = unsafe { core::slice::from_raw_parts(ptr, words) };

        if region[0] != GUARD_WORD {
            self.tasks[idx as usize].overflowed = true;
            self.notify(Event::StackOverflow { task: id });
            return Err(Error::State);
        }

        let free_words = match pattern {
            Some(pattern) => region[1..].iter().take_while(|&&w| w == pattern).count(),
            None => 0,
        };
        if free_words < self.stack_threshold_words {
            self.notify(Event::StackThreshold { task: id, free_words });
        }
        Ok(free_words)
    }

    /// Whether the task's stack guard word has been found overwritten by a
    /// previous [`Kernel::task_check_stack`] call. Such a task must not be
    /// scheduled again.
    pub fn task_has_overflowed(&self, id: TaskId) -> Result<bool> {
        let idx = self.resolve_task(id)?;
        Ok(self.tasks[idx as usize].overflowed)
    }
}
