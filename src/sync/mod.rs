//! Synchronization primitives: mutex, semaphore, message queue, task
//! signals, and buffer pool. All share the wait-list bookkeeping in
//! [`waitqueue`].

pub mod mutex;
pub mod pool;
pub mod queue;
pub mod semaphore;
pub mod signal;
pub(crate) mod waitqueue;
