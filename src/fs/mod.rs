//! Read-only block-addressed filesystem used to ship a boot image.
//!
//! This module owns no kernel state and is not generic over `Kernel`'s
//! const parameters — it is a leaf module, reachable from a task the same
//! way a driver would reach it, through a plain callback struct rather than
//! through the kernel critical section.

pub mod mfs;
