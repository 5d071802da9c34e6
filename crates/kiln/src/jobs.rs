//! A single background worker for slow housekeeping.
//!
//! Jobs run one at a time, in submission order, off the server loop.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct JobQueue {
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl JobQueue {
    /// Spawns the `kiln-jobs` worker thread.
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded::<Job>();
        let worker = thread::Builder::new()
            .name("kiln-jobs".into())
            .spawn(move || {
                for job in rx {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!("background job panicked");
                    }
                }
            });
        match worker {
            Ok(worker) => Self {
                tx: Some(tx),
                worker: Some(worker),
            },
            Err(e) => {
                tracing::error!(error = %e, "could not start job worker");
                Self {
                    tx: None,
                    worker: None,
                }
            }
        }
    }

    /// Queues `job`. Returns `false` once the queue is shut down.
    pub fn run(&self, job: impl FnOnce() + Send + 'static) -> bool {
        match &self.tx {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Runs what is already queued, then stops the worker.
    pub fn shutdown(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
