//! Units of work submitted to the scheduler

use std::fmt;
use std::sync::Arc;

use super::Counter;

/// Something a worker can run
///
/// The `param` is an inline word: either a small value or an index into data
/// owned by whoever prepared the phase.
pub trait Job: Send + Sync {
    fn run(&self, param: usize);
}

impl<F> Job for F
where
    F: Fn(usize) + Send + Sync,
{
    fn run(&self, param: usize) {
        self(param)
    }
}

/// Label carried with each declaration. Queues run in submission order;
/// only `Low` changes routing, by marking upkeep work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    /// Upkeep work run only when the queue is idle
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A job plus everything needed to run and account for it
#[derive(Clone)]
pub struct Declaration {
    pub task: Arc<dyn Job>,
    pub param: usize,
    pub priority: Priority,
    /// Decremented once after the job runs
    pub counter: Option<Arc<Counter>>,
}

impl Declaration {
    pub fn new(task: Arc<dyn Job>, param: usize) -> Self {
        Self {
            task,
            param,
            priority: Priority::Normal,
            counter: None,
        }
    }

    /// Build a declaration from a closure
    pub fn from_fn<F>(f: F, param: usize) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        Self::new(Arc::new(f), param)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_counter(mut self, counter: Arc<Counter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Run the job and retire it from its counter
    pub fn execute(&self) {
        self.task.run(self.param);
        if let Some(counter) = &self.counter {
            counter.decrement();
        }
    }
}

impl fmt::Debug for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declaration")
            .field("param", &self.param)
            .field("priority", &self.priority)
            .field("counter", &self.counter.as_ref().map(|c| c.load()))
            .finish()
    }
}
