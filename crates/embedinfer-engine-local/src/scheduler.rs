use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;

use crate::worker::Job;

/// Spreads jobs over the worker inboxes round-robin.
pub struct Scheduler {
    worker_txs: Vec<mpsc::UnboundedSender<Job>>,
    rr: AtomicUsize,
}

impl Scheduler {
    pub fn new(worker_txs: Vec<mpsc::UnboundedSender<Job>>) -> Self {
        Self {
            worker_txs,
            rr: AtomicUsize::new(0),
        }
    }

    /// Hands the job back when no worker can take it.
    pub fn dispatch(&self, job: Job) -> Result<(), Box<Job>> {
        if self.worker_txs.is_empty() {
            return Err(Box::new(job));
        }
        let idx = self.rr.fetch_add(1, Ordering::Relaxed) % self.worker_txs.len();
        self.worker_txs[idx]
            .send(job)
            .map_err(|e| Box::new(e.0))
    }

    /// Closes every inbox; workers drain what is queued and exit.
    pub fn close(&mut self) {
        self.worker_txs.clear();
    }
}
