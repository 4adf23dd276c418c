/// Bounded worker pool for chunk round-trips.
///
/// Jobs are handed over a rendezvous channel, so `submit` blocks until a
/// worker is free and at most `workers` jobs run at once. The first failing
/// job flips a shared flag that the submitter polls to stop scheduling.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};

use crate::error::{ProtocolError, Result};

pub type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Cooperative cancellation flag shared by a client and its workers.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct WorkerPool {
    jobs: Option<Sender<Job>>,
    done: Receiver<()>,
    errors: Receiver<ProtocolError>,
    failed: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let (job_tx, job_rx) = bounded::<Job>(0);
        // Never sent on; disconnects once every worker has exited.
        let (done_tx, done_rx) = bounded::<()>(0);
        let (err_tx, err_rx) = unbounded();
        let failed = Arc::new(AtomicBool::new(false));

        let handles = (0..workers.max(1))
            .map(|_| {
                let jobs = job_rx.clone();
                let errors = err_tx.clone();
                let failed = Arc::clone(&failed);
                let done = done_tx.clone();
                std::thread::spawn(move || {
                    let _done = done;
                    for job in jobs.iter() {
                        if failed.load(Ordering::SeqCst) {
                            continue;
                        }
                        let outcome = match catch_unwind(AssertUnwindSafe(job)) {
                            Ok(outcome) => outcome,
                            Err(_) => Err(ProtocolError::TransferFailed(
                                "chunk worker panicked".into(),
                            )),
                        };
                        if let Err(e) = outcome {
                            tracing::debug!("chunk failed: {}", e);
                            failed.store(true, Ordering::SeqCst);
                            let _ = errors.send(e);
                        }
                    }
                })
            })
            .collect();

        Self {
            jobs: Some(job_tx),
            done: done_rx,
            errors: err_rx,
            failed,
            handles,
        }
    }

    /// Hand a job to the next idle worker, blocking until one is free.
    pub fn submit(&self, job: Job) -> Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| ProtocolError::TransferFailed("pool is closed".into()))?;
        jobs.send(job)
            .map_err(|_| ProtocolError::TransferFailed("chunk workers have exited".into()))
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs and wait for in-flight ones.
    ///
    /// Waits up to `timeout` while everything succeeds and up to
    /// `drain_timeout` once a job has failed. Returns the first job error.
    pub fn join(mut self, timeout: Duration, drain_timeout: Duration) -> Result<()> {
        drop(self.jobs.take());

        let start = Instant::now();
        loop {
            let limit = if self.has_failed() { drain_timeout } else { timeout };
            let remaining = limit.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(ProtocolError::TransferFailed(format!(
                    "chunk workers did not finish within {:?}",
                    limit
                )));
            }
            match self.done.recv_timeout(remaining.min(Duration::from_millis(50))) {
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) | Ok(()) => {}
            }
        }

        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        match self.errors.try_recv() {
            Ok(err) => Err(ProtocolError::TransferFailed(err.to_string())),
            Err(_) => Ok(()),
        }
    }
}
