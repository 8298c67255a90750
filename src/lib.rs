//! A deterministic, priority-preemptive real-time kernel core for
//! single-core Cortex-M class targets, plus the TLSF allocator and MFS
//! read-only filesystem it boots with.
//!
//! There is no global kernel instance: an application owns one `Kernel<
//! TASKS, PRIORITIES, MUTEXES, SEMS, QUEUES, TIMERS, POOLS, B>` value, sized
//! entirely by its const generics, and calls methods on it directly. This
//! mirrors the const-generic sizing a fixed-capacity queue type would use,
//! just applied once to the whole kernel rather than per container.
#![cfg_attr(not(test), no_std)]

pub mod alloc;
pub mod bsp;
pub mod error;
pub mod fs;
pub mod handle;
pub mod kernel;
mod sched;
pub mod sync;
pub mod task;
mod time;
pub mod timer;
mod util;

pub use bsp::Bsp;
pub use error::{AssertCode, AssertHandler, Error, Module, Result};
pub use handle::{Handle, MutexId, PoolId, QueueId, SemId, TaskId, TimerId, INFINITE_TIMEOUT, NO_WAIT, SELF_TASK_ID};
pub use kernel::{Event, Kernel, NotifyFn, ReleaseStackFn};
pub use sync::signal::SignalMode;
pub use task::{CreateFlags, State, WakeCause};
pub use timer::TIMER_SERVICE_SIGNAL;
