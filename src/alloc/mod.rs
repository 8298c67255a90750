//! Deterministic dynamic memory: a two-level segregated-fit allocator over
//! a single caller-owned arena. See [`tlsf`] for the implementation; this
//! module itself is deliberately allocator-free — it never reaches for the
//! global allocator, since the whole point is to run where there isn't one.

pub mod tlsf;
