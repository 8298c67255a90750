//! Small, self-contained data structures shared by several modules.
//!
//! **Exempt from any API stability guarantee** — these exist to serve the
//! rest of the crate, not as a public collections library.

pub(crate) mod dlist;
pub(crate) mod prio_bitmap;
