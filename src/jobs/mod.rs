//! Phase-based job system
//!
//! A fixed pool of worker threads drains a shared queue. Work for the *next*
//! phase accumulates in a buffer queue and only becomes runnable when the
//! transition job calls [`Scheduler::advance_phase`], which waits for the
//! phase counter to drain before swapping the queues.

pub mod counter;
pub mod declaration;
pub mod scheduler;

pub use counter::Counter;
pub use declaration::{Declaration, Job, Priority};
pub use scheduler::{Scheduler, SchedulerHandle};
