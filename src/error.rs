//! Flat error taxonomy shared by every kernel primitive.
//!
//! `no_std` rules out `thiserror`/`anyhow` here the same way it does in the
//! sources this crate is descended from: the type is small, `Copy`, and
//! hand-rolls `Display` instead of pulling in an allocator-backed error
//! crate.

use core::fmt;

/// Transport-stable error codes returned by kernel primitives.
///
/// The discriminants intentionally start at the same ordinals the on-wire
/// taxonomy uses (`ENONE = 0`) so a numeric log of an error code can be
/// cross-referenced against the reference numbering without a lookup table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Error {
    /// Generic failure not covered by a more specific variant.
    Fail = 1,
    /// A bad argument was passed (out-of-range priority, unknown handle, wrong handle tag).
    Arg,
    /// A timed wait expired before the condition was satisfied.
    Timeout,
    /// A fixed-size table (tasks, mutexes, ...) has no free slot.
    Depleted,
    /// The object is not in a state that permits the requested operation.
    State,
    /// A non-blocking call would have had to block.
    WouldBlock,
    /// The wait was aborted by `flush` rather than satisfied normally.
    Flush,
    /// The operation is not permitted in the calling context (e.g. blocking from an ISR).
    NotAllowed,
    /// The allocator could not satisfy a request.
    Memory,
    /// A filesystem path did not resolve to an entry.
    NotFound,
    /// A filesystem block-read callback failed.
    Io,
    /// On-disk structure failed a consistency check.
    Corrupt,
    /// An argument was structurally invalid (bad whence, negative seek past start, ...).
    Invalid,
    /// A priority-inheritance chain exceeded its bounded length; indicates a mutex cycle.
    Cycle,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Fail => "operation failed",
            Error::Arg => "bad argument",
            Error::Timeout => "timed out",
            Error::Depleted => "table depleted",
            Error::State => "bad object state",
            Error::WouldBlock => "would block",
            Error::Flush => "wait flushed",
            Error::NotAllowed => "not allowed in this context",
            Error::Memory => "out of memory",
            Error::NotFound => "not found",
            Error::Io => "i/o error",
            Error::Corrupt => "corrupt structure",
            Error::Invalid => "invalid argument",
            Error::Cycle => "dependency cycle",
        };
        f.write_str(s)
    }
}

/// Shorthand used throughout the crate; kept local rather than re-exporting
/// `core::result::Result` under a different name so call sites read the same
/// as the rest of `core`.
pub type Result<T> = core::result::Result<T, Error>;

/// Identifies an assertion site for [`AssertHandler`].
///
/// `module` and `ordinal` together let a fielded build report a compact
/// numeric code (e.g. over a UART) instead of a string; `fatal` tells the
/// handler whether the kernel state is still trustworthy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AssertCode {
    pub module: Module,
    pub ordinal: u8,
    pub fatal: bool,
}

impl AssertCode {
    pub const fn new(module: Module, ordinal: u8, fatal: bool) -> Self {
        Self {
            module,
            ordinal,
            fatal,
        }
    }
}

/// Which component raised the assertion.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Module {
    Sched,
    Task,
    Time,
    Mutex,
    Semaphore,
    Queue,
    Signal,
    Pool,
    Timer,
}

/// A user-supplied callback invoked on invariant violations.
///
/// Default policy is to halt at a breakpoint in debug builds and spin in
/// release; the kernel does not rely on the callback actually diverging,
/// see [`crate::kernel::Kernel::fail`].
pub type AssertHandler = fn(file: &'static str, line: u32, code: AssertCode);

#[doc(hidden)]
#[macro_export]
macro_rules! kassert {
    ($kernel:expr, $cond:expr, $module:expr, $ordinal:expr, $fatal:expr) => {
        if !($cond) {
            $kernel.fail($crate::error::AssertCode::new($module, $ordinal, $fatal), file!(), line!());
        }
    };
}
