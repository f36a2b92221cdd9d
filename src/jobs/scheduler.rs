// src/jobs/scheduler.rs

//! Worker queues, detached jobs and the process-wide drain barrier
//!
//! A [`Scheduler`] is constructed once at startup and cloned into every
//! component that submits work. It owns:
//!
//! - any number of [`Queue`]s: fixed-size worker pools pulling jobs from an
//!   unbounded channel, each with its own completion count
//! - detached jobs launched with [`Scheduler::run`]: one short-lived thread
//!   per job, for independent blocking work that a bounded pool would
//!   needlessly serialize
//! - a global outstanding-job count spanning both, which backs
//!   [`Scheduler::wait`] and [`Scheduler::join`]
//!
//! A job that panics is logged and counted as finished. Queues and the
//! scheduler itself never die because of a single job; jobs report their
//! own failures through their callbacks or an
//! [`Aggregator`](super::Aggregator) slot.
//!
//! Calling `wait`/`join` from inside a job of the same queue (or from a
//! detached job for the process-wide variants) deadlocks, since the caller
//! counts itself as outstanding.

use crate::error::{Error, Result};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Message delivered to queue workers; one `Stop` is sent per worker
enum Message<J> {
    Run(J),
    Stop,
}

/// Type-erased handle used by the scheduler to stop a queue's workers
trait QueueControl: Send + Sync {
    fn shutdown(&self);
}

struct QueueEntry {
    waiting: usize,
    control: Arc<dyn QueueControl>,
}

#[derive(Default)]
struct SchedulerState {
    outstanding: usize,
    next_id: u64,
    /// Open queues; a queue that is not listed here is closed
    queues: HashMap<u64, QueueEntry>,
    /// Running detached jobs
    detached: HashMap<u64, JoinHandle<()>>,
    /// Detached jobs that have finished but were not joined yet
    finished: Vec<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<SchedulerState>,
    changed: Condvar,
}

/// Job scheduler shared by every component that submits work
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Scheduler")
            .field("outstanding", &state.outstanding)
            .field("queues", &state.queues.len())
            .field("detached", &state.detached.len())
            .finish()
    }
}

impl Scheduler {
    /// Create a scheduler with no queues and no running jobs
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState::default()),
                changed: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_while<'a, P>(
        &self,
        guard: MutexGuard<'a, SchedulerState>,
        mut condition: P,
    ) -> MutexGuard<'a, SchedulerState>
    where
        P: FnMut(&mut SchedulerState) -> bool,
    {
        self.shared
            .changed
            .wait_while(guard, |state| condition(state))
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a queue with `worker_count` long-lived workers
    ///
    /// Every job added to the queue is handed to `runner` on one of the
    /// workers. A `worker_count` of zero is treated as one.
    pub fn start_queue<J, F>(&self, worker_count: usize, runner: F) -> Result<Queue<J>>
    where
        J: Send + 'static,
        F: Fn(J) + Send + Sync + 'static,
    {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = mpsc::channel::<Message<J>>();
        let receiver = Arc::new(Mutex::new(receiver));
        let runner = Arc::new(runner);

        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;

        let mut workers = Vec::with_capacity(worker_count);
        for n in 0..worker_count {
            let receiver = Arc::clone(&receiver);
            let runner = Arc::clone(&runner);
            let scheduler = self.clone();
            let handle = thread::Builder::new()
                .name(format!("queue-{id}-{n}"))
                .spawn(move || worker_loop(&scheduler, id, &receiver, runner.as_ref()))
                .map_err(|e| Error::InitError(format!("Failed to spawn queue worker: {e}")))?;
            workers.push(handle);
        }

        let shared = Arc::new(QueueShared {
            sender,
            workers: Mutex::new(workers),
        });
        state.queues.insert(
            id,
            QueueEntry {
                waiting: 0,
                control: shared.clone(),
            },
        );
        debug!("Started queue {} with {} workers", id, worker_count);

        Ok(Queue {
            id,
            scheduler: self.clone(),
            shared,
        })
    }

    /// Run a job on its own detached thread
    ///
    /// The job counts towards [`Scheduler::wait`] and is reaped by
    /// [`Scheduler::join`]. If the thread cannot be spawned the job is
    /// dropped and an error returned.
    pub fn run<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reap_finished();

        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;

        let scheduler = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("job-{id}"))
            .spawn(move || {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    error!("Detached job failed (ignoring): {}", panic_message(payload.as_ref()));
                }
                scheduler.finish_detached(id);
            });

        match spawned {
            Ok(handle) => {
                state.outstanding += 1;
                state.detached.insert(id, handle);
                Ok(())
            }
            Err(e) => Err(Error::InitError(format!("Failed to spawn detached job: {e}"))),
        }
    }

    /// Block until no job is outstanding on any queue or detached thread
    pub fn wait(&self) {
        let state = self.lock();
        drop(self.wait_while(state, |state| state.outstanding > 0));
    }

    /// Drain all work, then stop every open queue and join every thread
    ///
    /// Meant to be called once at shutdown. Queues closed here reject
    /// further jobs with [`Error::QueueClosed`].
    pub fn join(&self) {
        self.wait();

        let (queues, detached, finished) = {
            let mut state = self.lock();
            (
                std::mem::take(&mut state.queues),
                std::mem::take(&mut state.detached),
                std::mem::take(&mut state.finished),
            )
        };

        for (id, entry) in queues {
            debug!("Stopping queue {}", id);
            entry.control.shutdown();
        }
        for handle in detached.into_values().chain(finished) {
            if handle.join().is_err() {
                error!("Detached job thread panicked outside its job");
            }
        }
    }

    /// Number of jobs currently queued or running, across all queues
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    fn finish_queued(&self, queue_id: u64) {
        let mut state = self.lock();
        if let Some(entry) = state.queues.get_mut(&queue_id) {
            entry.waiting = entry.waiting.saturating_sub(1);
        }
        state.outstanding = state.outstanding.saturating_sub(1);
        drop(state);
        self.shared.changed.notify_all();
    }

    fn finish_detached(&self, id: u64) {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if let Some(handle) = state.detached.remove(&id) {
            state.finished.push(handle);
        }
        drop(state);
        self.shared.changed.notify_all();
    }

    fn reap_finished(&self) {
        let finished = std::mem::take(&mut self.lock().finished);
        for handle in finished {
            if handle.join().is_err() {
                error!("Detached job thread panicked outside its job");
            }
        }
    }
}

struct QueueShared<J> {
    sender: Sender<Message<J>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<J: Send> QueueControl for QueueShared<J> {
    fn shutdown(&self) {
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for _ in &workers {
            // A worker that already exited has dropped nothing we need
            let _ = self.sender.send(Message::Stop);
        }
        for worker in workers {
            if worker.join().is_err() {
                error!("Queue worker panicked outside its job");
            }
        }
    }
}

/// Handle to a fixed-size worker pool owned by a [`Scheduler`]
pub struct Queue<J> {
    id: u64,
    scheduler: Scheduler,
    shared: Arc<QueueShared<J>>,
}

impl<J> Clone for Queue<J> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            scheduler: self.scheduler.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<J> std::fmt::Debug for Queue<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("id", &self.id).finish()
    }
}

impl<J: Send + 'static> Queue<J> {
    /// Enqueue a job; fails once the queue has been joined
    pub fn add(&self, job: J) -> Result<()> {
        let mut state = self.scheduler.lock();
        let Some(entry) = state.queues.get_mut(&self.id) else {
            return Err(Error::QueueClosed);
        };
        entry.waiting += 1;
        state.outstanding += 1;

        if self.shared.sender.send(Message::Run(job)).is_err() {
            // Every worker is gone; undo the bookkeeping
            if let Some(entry) = state.queues.get_mut(&self.id) {
                entry.waiting -= 1;
            }
            state.outstanding -= 1;
            return Err(Error::QueueClosed);
        }
        Ok(())
    }

    /// Block until every job added to this queue so far has completed
    ///
    /// Does not prevent new jobs from being added meanwhile.
    pub fn wait(&self) {
        let state = self.scheduler.lock();
        drop(self.scheduler.wait_while(state, |state| {
            state
                .queues
                .get(&self.id)
                .is_some_and(|entry| entry.waiting > 0)
        }));
    }

    /// Wait for the queue to drain, then stop its workers
    ///
    /// Idempotent; later calls (and calls after [`Scheduler::join`]) return
    /// immediately.
    pub fn join(&self) {
        self.wait();
        let removed = self.scheduler.lock().queues.remove(&self.id);
        if removed.is_some() {
            self.shared.shutdown();
            debug!("Joined queue {}", self.id);
        }
    }

    /// Whether the queue still accepts jobs
    pub fn is_open(&self) -> bool {
        self.scheduler.lock().queues.contains_key(&self.id)
    }
}

fn worker_loop<J, F>(
    scheduler: &Scheduler,
    queue_id: u64,
    receiver: &Mutex<Receiver<Message<J>>>,
    runner: &F,
) where
    F: Fn(J),
{
    loop {
        let message = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        match message {
            Ok(Message::Run(job)) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| runner(job))) {
                    error!("Job failed (ignoring): {}", panic_message(payload.as_ref()));
                }
                scheduler.finish_queued(queue_id);
            }
            Ok(Message::Stop) | Err(_) => break,
        }
    }
}

/// Extract a printable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
