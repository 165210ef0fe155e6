//! Background Workers
//!
//! Named threads owned by the data source:
//! - `CommitWorker`: applies one part of each commit and replies to the
//!   committing thread
//! - `MergeScheduler`: runs merges on the `MergePolicy` cadence
//!
//! Every worker signals a `done` channel when its thread exits, so shutdown
//! can wait with a deadline instead of joining blindly.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::config::MergeConfig;
use crate::datafile::{MergeFilter, MergePolicy};
use crate::error::{Result, StoreError};

/// A job plus the channel its outcome goes back on
struct Job<J> {
    payload: J,
    reply: Sender<Result<()>>,
}

/// Handle to a pending commit part
#[derive(Debug)]
pub struct Pending {
    worker: String,
    reply: Receiver<Result<()>>,
}

impl Pending {
    /// Block until the worker has applied the job
    pub fn wait(self) -> Result<()> {
        self.reply.recv().map_err(|_| {
            StoreError::Worker(format!("{} exited before replying", self.worker))
        })?
    }
}

/// Thread applying one kind of commit job at a time
pub struct CommitWorker<J: Send + 'static> {
    name: String,
    jobs: Option<Sender<Job<J>>>,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl<J: Send + 'static> CommitWorker<J> {
    /// Spawn a worker thread calling `handler` for every job
    pub fn spawn<F>(name: &str, mut handler: F) -> Result<Self>
    where
        F: FnMut(J) -> Result<()> + Send + 'static,
    {
        let (jobs_tx, jobs_rx) = channel::unbounded::<Job<J>>();
        let (done_tx, done_rx) = channel::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in jobs_rx.iter() {
                    let result = handler(job.payload);
                    if let Err(e) = &result {
                        tracing::error!(error = %e, "commit job failed");
                    }
                    // The committer may have given up waiting
                    let _ = job.reply.send(result);
                }
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            name: name.to_string(),
            jobs: Some(jobs_tx),
            done: done_rx,
            handle: Some(handle),
        })
    }

    /// Queue `payload`, returning a handle to wait on
    pub fn submit(&self, payload: J) -> Result<Pending> {
        let jobs = self.jobs.as_ref().ok_or(StoreError::Closed)?;
        let (reply_tx, reply_rx) = channel::bounded(1);
        jobs.send(Job {
            payload,
            reply: reply_tx,
        })
        .map_err(|_| StoreError::Worker(format!("{} is not running", self.name)))?;

        Ok(Pending {
            worker: self.name.clone(),
            reply: reply_rx,
        })
    }

    /// Stop accepting jobs and wait up to `timeout` for the queue to drain
    pub fn shutdown(mut self, timeout: Duration) -> Result<()> {
        self.jobs.take();
        wait_for_exit(&self.name, &self.done, self.handle.take(), timeout)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Thread running merges until stopped
pub struct MergeScheduler {
    stop: Option<Sender<()>>,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl MergeScheduler {
    pub const THREAD_NAME: &'static str = "vmstore-merge";

    /// Spawn the scheduler; `run` performs one merge with the given filter
    pub fn spawn<F>(config: MergeConfig, mut run: F) -> Result<Self>
    where
        F: FnMut(MergeFilter) -> Result<()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let (done_tx, done_rx) = channel::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name(Self::THREAD_NAME.to_string())
            .spawn(move || {
                let period = config.period;
                let mut wait = config.initial_delay;
                let mut policy = MergePolicy::new(config, Instant::now());

                loop {
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {
                            let filter = policy.next_filter(Instant::now());
                            tracing::debug!(%filter, "starting scheduled merge");
                            if let Err(e) = run(filter) {
                                // Retried next period
                                tracing::warn!(%filter, error = %e, "scheduled merge failed");
                            }
                            wait = period;
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            done: done_rx,
            handle: Some(handle),
        })
    }

    /// Stop scheduling and wait up to `timeout` for a running merge
    pub fn stop(mut self, timeout: Duration) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        wait_for_exit(Self::THREAD_NAME, &self.done, self.handle.take(), timeout)
    }
}

fn wait_for_exit(
    name: &str,
    done: &Receiver<()>,
    handle: Option<JoinHandle<()>>,
    timeout: Duration,
) -> Result<()> {
    match done.recv_timeout(timeout) {
        // Disconnected: the thread is gone, possibly after a panic
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
        Err(RecvTimeoutError::Timeout) => {
            tracing::error!(worker = name, ?timeout, "worker did not stop in time");
            return Err(StoreError::ShutdownTimeout(name.to_string()));
        }
    }

    if let Some(handle) = handle {
        if handle.join().is_err() {
            return Err(StoreError::Worker(format!("{} panicked", name)));
        }
    }
    Ok(())
}
