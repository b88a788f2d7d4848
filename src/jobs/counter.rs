//! Atomic job counter used as a phase barrier

use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of outstanding jobs in a phase
///
/// Each job declaration that references a counter decrements it exactly once
/// after running. The counter is never observed below zero.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicUsize,
}

impl Counter {
    pub fn new(value: usize) -> Self {
        Self {
            value: AtomicUsize::new(value),
        }
    }

    #[inline]
    pub fn load(&self) -> usize {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: usize) {
        self.value.store(value, Ordering::Release);
    }

    #[inline]
    pub fn is_at(&self, value: usize) -> bool {
        self.load() == value
    }

    #[inline]
    pub fn is_drained(&self) -> bool {
        self.is_at(0)
    }

    /// Mark one unit of work complete; returns the new value
    pub fn decrement(&self) -> usize {
        let result = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        match result {
            Ok(prev) => prev - 1,
            Err(_) => {
                debug_assert!(false, "job counter decremented past zero");
                log::error!("job counter decremented past zero; ignoring");
                0
            }
        }
    }
}
