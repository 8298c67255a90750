//! The kernel state aggregate.
//!
//! Per the design this crate follows, kernel state is a single mutable
//! structure rather than objects scattered across `'static` storage chosen
//! by a compile-time configuration builder (contrast `r3_kernel::System`,
//! generic over a `Traits` type picked by a `Cfg` macro). `Kernel` is sized
//! entirely by direct `const` generic parameters, mirroring how the
//! teacher sizes an individual container like `BitmapQueue<..., const LEN:
//! usize>` — just applied once, to the whole kernel, instead of per
//! collection.

use crate::bsp::Bsp;
use crate::error::{AssertCode, AssertHandler, Error, Result};
use crate::handle::TaskId;
use crate::sync::mutex::Mutex;
use crate::sync::pool::Pool;
use crate::sync::queue::Queue;
use crate::sync::semaphore::Semaphore;
use crate::task::Tcb;
use crate::timer::Timer;
use crate::util::dlist::ListHead;
use crate::util::prio_bitmap::PrioBitmap;

/// Event codes passed to [`NotifyFn`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Event {
    /// A task's unused stack margin dropped below the configured threshold.
    StackThreshold { task: TaskId, free_words: usize },
    /// A task's stack guard word was overwritten; the task will not be resumed.
    StackOverflow { task: TaskId },
}

/// Callback invoked for diagnostic events that are not outright fatal.
pub type NotifyFn = fn(Event);

/// Callback that reclaims a deleted task's stack buffer, invoked once the
/// idle task has safely unwound any reference to it.
pub type ReleaseStackFn = fn(ptr: *mut u8, len: usize);

/// Fixed-capacity kernel state: ready set, delay list, and every static
/// object table, parameterized entirely by direct `const` generics.
///
/// Generic parameter order: task table size, priority level count, mutex
/// table size, semaphore table size, queue table size, timer table size,
/// pool table size, then the board support type.
pub struct Kernel<
    const TASKS: usize,
    const PRIORITIES: usize,
    const MUTEXES: usize,
    const SEMS: usize,
    const QUEUES: usize,
    const TIMERS: usize,
    const POOLS: usize,
    B: Bsp,
> {
    pub(crate) tasks: [Tcb; TASKS],
    pub(crate) ready_bitmap: PrioBitmap<PRIORITIES>,
    pub(crate) ready_queues: [ListHead; PRIORITIES],
    pub(crate) delay_list: ListHead,
    pub(crate) to_delete: ListHead,
    pub(crate) current: Option<u16>,
    pub(crate) pending_outgoing: Option<u16>,
    pub(crate) tick_count: u32,
    pub(crate) crit_nest: u32,
    pub(crate) crit_saved_irq: u32,
    pub(crate) isr_nest: u32,
    pub(crate) reschedule_pending: bool,
    pub(crate) stack_fill: Option<u32>,
    pub(crate) stack_threshold_words: usize,

    pub(crate) mutexes: [Mutex; MUTEXES],
    pub(crate) sems: [Semaphore; SEMS],
    pub(crate) queues: [Queue; QUEUES],
    pub(crate) timers: [Timer; TIMERS],
    pub(crate) timer_list: ListHead,
    pub(crate) timer_due: ListHead,
    pub(crate) timer_service_task: Option<u16>,
    pub(crate) pools: [Pool; POOLS],

    pub(crate) bsp: B,
    pub(crate) assert_handler: AssertHandler,
    pub(crate) notify: NotifyFn,
    pub(crate) release_stack: ReleaseStackFn,
}

fn default_notify(_event: Event) {}

fn default_release_stack(_ptr: *mut u8, _len: usize) {}

fn default_assert_handler(_file: &'static str, _line: u32, _code: AssertCode) {}

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
    /// Build an idle kernel. No task is running and nothing is scheduled
    /// until tasks are created with [`crate::task`] operations and the BSP
    /// hands control to [`Kernel::schedule`].
    pub fn new(bsp: B) -> Self {
        const { assert!(TASKS >= 1 && TASKS <= u16::MAX as usize - 2, "task table too large for a 16-bit index") }
        Self {
            tasks: core::array::from_fn(|_| Tcb::new()),
            ready_bitmap: PrioBitmap::EMPTY,
            ready_queues: [ListHead::EMPTY; PRIORITIES],
            delay_list: ListHead::EMPTY,
            to_delete: ListHead::EMPTY,
            current: None,
            pending_outgoing: None,
            tick_count: 0,
            crit_nest: 0,
            crit_saved_irq: 0,
            isr_nest: 0,
            reschedule_pending: false,
            stack_fill: None,
            stack_threshold_words: 0,
            mutexes: core::array::from_fn(|_| Mutex::new()),
            sems: core::array::from_fn(|_| Semaphore::new()),
            queues: core::array::from_fn(|_| Queue::new()),
            timers: core::array::from_fn(|_| Timer::new()),
            timer_list: ListHead::EMPTY,
            timer_due: ListHead::EMPTY,
            timer_service_task: None,
            pools: core::array::from_fn(|_| Pool::new()),
            bsp,
            assert_handler: default_assert_handler,
            notify: default_notify,
            release_stack: default_release_stack,
        }
    }

    /// Install the diagnostic callbacks. Called once, before any task runs.
    pub fn configure(
        &mut self,
        tick_hz: u32,
        stack_fill: Option<u32>,
        stack_threshold_words: usize,
        assert_handler: AssertHandler,
        notify: NotifyFn,
        release_stack: ReleaseStackFn,
    ) {
        self.stack_fill = stack_fill;
        self.stack_threshold_words = stack_threshold_words;
        self.assert_handler = assert_handler;
        self.notify = notify;
        self.release_stack = release_stack;
        self.bsp.tick_configure(tick_hz);
    }

    pub fn notify(&self, event: Event) {
        (self.notify)(event);
    }

    /// Route a detected invariant violation to the user callback.
    ///
    /// The default policy ("halt at a breakpoint in debug, spin in a safe
    /// loop in release") is honored regardless of whether the supplied
    /// handler actually diverges: a fatal code always ends in a spin loop
    /// here, so a handler that merely logs and returns cannot leave the
    /// kernel running over state it has declared untrustworthy.
    #[inline(never)]
    pub fn fail(&self, code: AssertCode, file: &'static str, line: u32) -> ! {
        (self.assert_handler)(file, line, code);
        loop {
            core::hint::spin_loop();
        }
    }

    /// Enter the kernel critical section. Nestable; only the outermost call
    /// actually masks interrupts.
    #[inline]
    pub fn critical_enter(&mut self) {
        if self.crit_nest == 0 {
            self.crit_saved_irq = self.bsp.irq_save_disable();
        }
        self.crit_nest += 1;
    }

    /// Leave the kernel critical section. Restores interrupts only when the
    /// outermost nesting level exits.
    #[inline]
    pub fn critical_exit(&mut self) {
        debug_assert!(self.crit_nest > 0, "unbalanced critical section exit");
        self.crit_nest -= 1;
        if self.crit_nest == 0 {
            self.bsp.irq_restore(self.crit_saved_irq);
        }
    }

    pub fn is_in_isr(&self) -> bool {
        self.isr_nest > 0
    }

    /// Mark entry into interrupt context. Must be paired with [`Kernel::isr_exit`].
    pub fn isr_enter(&mut self) {
        self.isr_nest += 1;
    }

    /// Leave interrupt context. If this was the outermost ISR and a
    /// reschedule was requested while inside it, the context switch is
    /// triggered now rather than while still nested inside interrupt
    /// context.
    pub fn isr_exit(&mut self) {
        debug_assert!(self.isr_nest > 0, "unbalanced isr_exit");
        self.isr_nest -= 1;
        if self.isr_nest == 0 && self.reschedule_pending {
            self.reschedule_pending = false;
            self.bsp.trigger_context_switch();
        }
    }

    /// Resolve `id` to a task index, expanding `SELF_TASK_ID`.
    pub(crate) fn resolve_task(&self, id: TaskId) -> Result<u16> {
        use crate::handle::{Handle, SELF_TASK_ID};
        if id == SELF_TASK_ID {
            return self.current.ok_or(Error::State);
        }
        let id = TaskId::from_raw(id.raw())?;
        let idx = id.index();
        if idx >= TASKS || !self.tasks[idx].in_use() {
            return Err(Error::Arg);
        }
        Ok(idx as u16)
    }

    pub(crate) fn current_index(&self) -> Option<u16> {
        self.current
    }
}
