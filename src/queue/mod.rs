//! MPMC queues (spec §4.6): unbounded and bounded variants sharing the
//! same buffer-plus-wait-list shape.

pub mod bounded;
pub mod unbounded;
