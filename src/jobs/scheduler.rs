//! Worker threads and the phase transition protocol
//!
//! Three queues live behind one mutex:
//! - `current`: runnable now, drained by the workers
//! - `buffer`: next phase, swapped in by [`SchedulerHandle::advance_phase`]
//! - `delayed`: the phase after next, moved into `buffer` at each transition
//!
//! The last worker doubles as the upkeep worker: when it finishes a job and
//! finds the queue empty it runs one registered low-priority job.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex, RwLock};

use super::{Counter, Declaration, Priority};
use crate::error::SimError;

#[derive(Default)]
struct Queues {
    current: VecDeque<Declaration>,
    buffer: VecDeque<Declaration>,
    delayed: VecDeque<Declaration>,
}

struct Inner {
    queues: Mutex<Queues>,
    work_ready: Condvar,
    shutdown: AtomicBool,
    upkeep: RwLock<Vec<Declaration>>,
    upkeep_cursor: AtomicUsize,
    transitions: AtomicU64,
}

/// Cloneable access to a running scheduler
///
/// Jobs capture a handle to submit follow-up work or, for the transition
/// job, to advance the phase.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<Inner>,
}

/// Owns the worker threads; shuts them down on drop
pub struct Scheduler {
    handle: SchedulerHandle,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn `worker_threads` workers (at least two: the transition job
    /// occupies one while it waits on the phase counter)
    pub fn new(worker_threads: usize) -> Result<Self, SimError> {
        if worker_threads < 2 {
            return Err(SimError::InvalidConfig(format!(
                "scheduler needs at least 2 workers (got {worker_threads})"
            )));
        }

        let handle = SchedulerHandle {
            inner: Arc::new(Inner {
                queues: Mutex::new(Queues::default()),
                work_ready: Condvar::new(),
                shutdown: AtomicBool::new(false),
                upkeep: RwLock::new(Vec::new()),
                upkeep_cursor: AtomicUsize::new(0),
                transitions: AtomicU64::new(0),
            }),
        };

        let mut workers = Vec::with_capacity(worker_threads);
        for index in 0..worker_threads {
            let inner = Arc::clone(&handle.inner);
            let upkeep_worker = index == worker_threads - 1;
            let worker = thread::Builder::new()
                .name(format!("sim-worker-{index}"))
                .spawn(move || worker_loop(&inner, upkeep_worker))
                .map_err(|e| SimError::InvalidConfig(format!("failed to spawn worker: {e}")))?;
            workers.push(worker);
        }

        log::info!("Job system started with {worker_threads} workers");
        Ok(Self { handle, workers })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Deref for Scheduler {
    type Target = SchedulerHandle;

    fn deref(&self) -> &SchedulerHandle {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.handle.shutdown();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Worker thread panicked");
            }
        }
        log::info!("Job system stopped");
    }
}

impl SchedulerHandle {
    /// Push a job onto the current queue
    pub fn submit(&self, decl: Declaration) {
        self.inner.queues.lock().current.push_back(decl);
        self.inner.work_ready.notify_one();
    }

    /// Push several jobs onto the current queue
    pub fn submit_batch(&self, decls: impl IntoIterator<Item = Declaration>) {
        self.inner.queues.lock().current.extend(decls);
        self.inner.work_ready.notify_all();
    }

    /// Queue a job for the next phase
    pub fn submit_to_next_phase(&self, decl: Declaration) {
        self.inner.queues.lock().buffer.push_back(decl);
    }

    /// Queue several jobs for the next phase
    pub fn submit_batch_to_next_phase(&self, decls: impl IntoIterator<Item = Declaration>) {
        self.inner.queues.lock().buffer.extend(decls);
    }

    /// Queue a job for the phase after next
    pub fn submit_delayed(&self, decl: Declaration) {
        self.inner.queues.lock().delayed.push_back(decl);
    }

    /// Register an always-on job for the upkeep worker
    pub fn add_upkeep(&self, decl: Declaration) {
        debug_assert!(decl.counter.is_none(), "upkeep jobs are never counted");
        self.inner
            .upkeep
            .write()
            .push(decl.with_priority(Priority::Low));
    }

    /// Wait for the phase counter to drain, then make the buffered phase
    /// runnable.
    ///
    /// The counter is reset to the number of swapped-in jobs, minus the
    /// uncounted transition job, plus one if the driver thread takes part in
    /// the following barrier. Returns `false` if shutdown was requested
    /// before the swap happened.
    pub fn advance_phase(&self, counter: &Counter, include_driver: bool) -> bool {
        let backoff = Backoff::new();
        loop {
            if self.is_shutdown() {
                return false;
            }

            if counter.is_drained() {
                let mut queues = self.inner.queues.lock();
                if !queues.buffer.is_empty() {
                    let queues = &mut *queues;
                    std::mem::swap(&mut queues.current, &mut queues.buffer);

                    counter.set(queues.current.len() + include_driver as usize - 1);

                    // Uncounted stragglers from the old phase keep running
                    let leftovers = std::mem::take(&mut queues.buffer);
                    queues.current.extend(leftovers);

                    if !queues.delayed.is_empty() {
                        std::mem::swap(&mut queues.buffer, &mut queues.delayed);
                    }

                    let transitions = self.inner.transitions.fetch_add(1, Ordering::AcqRel) + 1;
                    log::trace!(
                        "Phase transition {transitions}: {} runnable, counter {}",
                        queues.current.len(),
                        counter.load()
                    );
                    self.inner.work_ready.notify_all();
                    return true;
                }
            }

            backoff.snooze();
        }
    }

    /// Spin-yield until `counter` drains (or shutdown)
    pub fn wait_for_counter(&self, counter: &Counter) {
        let backoff = Backoff::new();
        while !counter.is_drained() && !self.is_shutdown() {
            backoff.snooze();
        }
    }

    /// Run a batch to completion from the calling thread
    pub fn submit_and_wait(&self, decls: Vec<Declaration>) {
        let counter = Arc::new(Counter::new(decls.len()));
        self.submit_batch(
            decls
                .into_iter()
                .map(|d| d.with_counter(Arc::clone(&counter))),
        );
        self.wait_for_counter(&counter);
    }

    /// Number of phase transitions performed so far
    pub fn transitions(&self) -> u64 {
        self.inner.transitions.load(Ordering::Acquire)
    }

    pub fn has_buffered_work(&self) -> bool {
        !self.inner.queues.lock().buffer.is_empty()
    }

    pub fn pending_jobs(&self) -> usize {
        self.inner.queues.lock().current.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Request cooperative shutdown; workers drain the current queue and exit
    pub fn shutdown(&self) {
        {
            let _queues = self.inner.queues.lock();
            self.inner.shutdown.store(true, Ordering::Release);
        }
        self.inner.work_ready.notify_all();
    }
}

fn worker_loop(inner: &Inner, upkeep_worker: bool) {
    loop {
        let decl = {
            let mut queues = inner.queues.lock();
            loop {
                if let Some(decl) = queues.current.pop_front() {
                    break decl;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queues);
            }
        };

        decl.execute();

        if upkeep_worker {
            run_upkeep(inner);
        }
    }
}

/// Run one upkeep job if the current queue is idle
fn run_upkeep(inner: &Inner) {
    if inner.shutdown.load(Ordering::Acquire) || !inner.queues.lock().current.is_empty() {
        return;
    }
    let decl = {
        let upkeep = inner.upkeep.read();
        if upkeep.is_empty() {
            return;
        }
        let index = inner.upkeep_cursor.fetch_add(1, Ordering::Relaxed) % upkeep.len();
        upkeep[index].clone()
    };
    decl.task.run(decl.param);
}
