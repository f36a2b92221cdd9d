// src/jobs/aggregator.rs

//! Fan-out/fan-in collection of job results
//!
//! An [`Aggregator`] hands out one [`Completion`] per sub-job. Each
//! completion owns a fixed slot in the result list, so results come back in
//! the order they were requested no matter which job finishes first. The
//! first error (by completion time) is remembered; later errors are
//! discarded.
//!
//! A completion is consumed when it reports, so reporting twice is ruled
//! out at compile time. A completion dropped without reporting (including
//! by a panicking job) records [`Error::JobFailed`] for its slot, so a
//! waiter can never hang on a lost job.

use super::scheduler::Scheduler;
use crate::error::{Error, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::warn;

struct BatchState<T> {
    results: Vec<Option<T>>,
    waiting: usize,
    error: Option<Error>,
    closed: bool,
}

struct Batch<T> {
    state: Mutex<BatchState<T>>,
    finished: Condvar,
}

impl<T> Batch<T> {
    fn lock(&self) -> MutexGuard<'_, BatchState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fill(&self, slot: usize, result: Result<T>) {
        let mut state = self.lock();
        match result {
            Ok(value) => state.results[slot] = Some(value),
            Err(e) => {
                if state.error.is_none() {
                    state.error = Some(e);
                }
            }
        }
        state.waiting -= 1;
        if state.waiting == 0 {
            self.finished.notify_all();
        }
    }

    fn wait_closed(&self) -> MutexGuard<'_, BatchState<T>> {
        let mut state = self.lock();
        state.closed = true;
        self.finished
            .wait_while(state, |state| state.waiting > 0)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// One-shot reporter for a single aggregator slot
#[must_use = "a dropped completion reports a failure for its slot"]
pub struct Completion<T> {
    batch: Option<Arc<Batch<T>>>,
    slot: usize,
}

impl<T> Completion<T> {
    /// Report the outcome of this sub-job
    pub fn complete(mut self, result: Result<T>) {
        if let Some(batch) = self.batch.take() {
            batch.fill(self.slot, result);
        }
    }

    /// Position of this completion's result in the aggregate
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            batch.fill(
                self.slot,
                Err(Error::JobFailed(format!(
                    "job for slot {} finished without reporting a result",
                    self.slot
                ))),
            );
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").field("slot", &self.slot).finish()
    }
}

/// Collects the results of a batch of jobs in request order
pub struct Aggregator<T> {
    batch: Arc<Batch<T>>,
    scheduler: Scheduler,
}

impl<T: Send + 'static> Aggregator<T> {
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            batch: Arc::new(Batch {
                state: Mutex::new(BatchState {
                    results: Vec::new(),
                    waiting: 0,
                    error: None,
                    closed: false,
                }),
                finished: Condvar::new(),
            }),
            scheduler: scheduler.clone(),
        }
    }

    /// Allocate the next result slot
    ///
    /// # Panics
    ///
    /// Panics if the aggregator has already been waited on; adding work to
    /// a finalized batch is a programming error.
    pub fn collect(&self) -> Completion<T> {
        let mut state = self.batch.lock();
        assert!(!state.closed, "collect() called on a finalized aggregator");
        let slot = state.results.len();
        state.results.push(None);
        state.waiting += 1;
        Completion {
            batch: Some(Arc::clone(&self.batch)),
            slot,
        }
    }

    /// Run `f` once per item as detached jobs, each filling its own slot
    pub fn run_each<I, F>(&self, items: I, f: F)
    where
        I: IntoIterator,
        I::Item: Send + 'static,
        F: Fn(I::Item) -> Result<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        for item in items {
            let completion = self.collect();
            let f = Arc::clone(&f);
            // On spawn failure the job is dropped and so is its completion,
            // which records the failure in its slot
            if let Err(e) = self.scheduler.run(move || completion.complete(f(item))) {
                warn!("Could not start job: {}", e);
            }
        }
    }

    /// Close the batch and block until every slot has reported
    pub fn wait(&self) {
        drop(self.batch.wait_closed());
    }

    /// Like [`Aggregator::wait`], but fail with the first recorded error
    pub fn wait_throw(&self) -> Result<()> {
        match self.batch.wait_closed().error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// First error recorded so far, if any
    pub fn error(&self) -> Option<Error> {
        self.batch.lock().error.clone()
    }

    /// Wait, then return every slot together with the first error
    ///
    /// Slots of failed jobs are `None`.
    pub fn get(self) -> (Vec<Option<T>>, Option<Error>) {
        let mut state = self.batch.wait_closed();
        (std::mem::take(&mut state.results), state.error.take())
    }

    /// Wait, then return all results or the first error
    pub fn results_throw(self) -> Result<Vec<T>> {
        let (results, error) = self.get();
        if let Some(e) = error {
            return Err(e);
        }
        results
            .into_iter()
            .collect::<Option<Vec<T>>>()
            .ok_or_else(|| Error::JobFailed("missing result without recorded error".to_string()))
    }

    /// Deliver the outcome to `callback` from a detached job once all slots
    /// have reported
    pub fn on_complete<F>(self, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Vec<T>>) + Send + 'static,
    {
        let scheduler = self.scheduler.clone();
        scheduler.run(move || callback(self.results_throw()))
    }
}
