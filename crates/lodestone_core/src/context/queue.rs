//! Per-context execution queue and completion handle.
//!
//! # Responsibility
//! - Run every operation of one context on one dedicated worker, FIFO.
//! - Provide a synchronous entry point that is re-entrant from the
//!   queue's own thread, mirroring a perform-and-wait.
//! - Deliver asynchronous completions exactly once through `Task`.
//!
//! # Invariants
//! - Jobs submitted to one queue execute in submission order.
//! - A panicking job is contained and logged; the queue keeps draining.
//! - `Task` resolves at most once; the resolving send happens from a job
//!   on the originating context's queue.

use log::error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct ContextQueue {
    label: String,
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl ContextQueue {
    pub(crate) fn new(label: impl Into<String>) -> Arc<Self> {
        let label = label.into();
        let (tx, rx) = mpsc::channel::<Job>();
        let worker_label = label.clone();
        let worker = thread::Builder::new()
            .name(format!("lodestone-{label}"))
            .spawn(move || drain(&worker_label, &rx))
            .expect("failed to spawn context queue worker");
        let thread_id = worker.thread().id();

        Arc::new(Self {
            label,
            tx: Some(tx),
            worker: Some(worker),
            thread_id,
        })
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Submits a job; FIFO relative to every other submission.
    pub(crate) fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.tx {
            if tx.send(Box::new(job)).is_err() {
                error!(
                    "event=queue_dispatch module=context status=error label={} detail=closed",
                    self.label
                );
            }
        }
    }

    /// Runs `f` on the queue and waits for its result. Runs inline when
    /// already on the queue's own thread, so queued work may call back
    /// into its own context without deadlocking.
    pub(crate) fn run_sync<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return f();
        }
        let (tx, rx) = mpsc::channel();
        self.dispatch(move || {
            let _ = tx.send(f());
        });
        // Only fails when the job panicked; the panic was already logged.
        rx.recv()
            .expect("context queue dropped a synchronous job")
    }
}

impl Drop for ContextQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
            // A queue dropped from its own worker (the last handle died
            // inside a job) detaches instead of joining itself.
        }
    }
}

fn drain(label: &str, rx: &Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("event=queue_job module=context status=error label={label} detail=panic");
        }
    }
}

/// Completion handle for one asynchronous operation.
///
/// Resolves exactly once; the resolving send is issued from a job running
/// on the context that initiated the operation.
pub struct Task<T> {
    rx: Receiver<T>,
}

impl<T> Task<T> {
    pub(crate) fn channel() -> (TaskCompletion<T>, Self) {
        let (tx, rx) = mpsc::channel();
        (TaskCompletion { tx }, Self { rx })
    }

    /// Blocks until the operation completes.
    pub fn wait(self) -> T {
        self.rx
            .recv()
            .expect("task completion dropped before resolving")
    }

    /// Blocks up to `timeout`; `None` when the operation is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }
}

pub(crate) struct TaskCompletion<T> {
    tx: Sender<T>,
}

impl<T> TaskCompletion<T> {
    pub(crate) fn resolve(self, value: T) {
        // The task may have been dropped by a caller that stopped caring;
        // late completions are discarded above this layer by design.
        let _ = self.tx.send(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn jobs_run_in_submission_order() {
        let queue = ContextQueue::new("test-fifo");
        let (tx, rx) = mpsc::channel();
        for index in 0..8 {
            let tx = tx.clone();
            queue.dispatch(move || {
                let _ = tx.send(index);
            });
        }
        let received: Vec<_> = (0..8).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(received, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn run_sync_returns_the_job_result() {
        let queue = ContextQueue::new("test-sync");
        let value = queue.run_sync(|| 21 * 2);
        assert_eq!(value, 42);
    }

    #[test]
    fn run_sync_is_reentrant_from_the_queue_thread() {
        let queue = ContextQueue::new("test-reentrant");
        let inner = queue.clone();
        let value = queue.run_sync(move || inner.run_sync(|| 7));
        assert_eq!(value, 7);
    }

    #[test]
    fn a_panicking_job_does_not_kill_the_queue() {
        let queue = ContextQueue::new("test-panic");
        let counter = Arc::new(AtomicUsize::new(0));
        queue.dispatch(|| panic!("boom"));
        let after = counter.clone();
        queue.run_sync(move || after.fetch_add(1, Ordering::SeqCst));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn task_resolves_exactly_once() {
        let (completion, task) = Task::channel();
        completion.resolve(5_u32);
        assert_eq!(task.wait(), 5);
    }

    #[test]
    fn task_wait_timeout_reports_pending_operations() {
        let (completion, task) = Task::<u32>::channel();
        assert_eq!(task.wait_timeout(Duration::from_millis(10)), None);
        completion.resolve(9);
        assert_eq!(task.wait_timeout(Duration::from_millis(100)), Some(9));
    }
}
