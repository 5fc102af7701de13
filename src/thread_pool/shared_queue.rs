use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, warn};

use super::ThreadPool;
use crate::{KvsError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A thread pool whose workers take jobs from one shared crossbeam [`channel`].
///
/// A worker whose job panics is replaced by a fresh thread, so a misbehaving connection does not
/// shrink the pool.
///
/// [`channel`]: https://docs.rs/crossbeam/0.8.1/crossbeam/channel/index.html
#[derive(Debug)]
pub struct SharedQueueThreadPool {
    tx: Sender<Job>,
}

impl ThreadPool for SharedQueueThreadPool {
    fn new(threads: u32) -> Result<Self> {
        if threads == 0 {
            return Err(KvsError::Parsing("a pool needs at least one thread".to_owned()));
        }
        let (tx, rx) = channel::unbounded::<Job>();
        for id in 0..threads {
            spawn_worker(Worker { id, rx: rx.clone() })?;
        }
        debug!("created shared queue pool with {} threads", threads);
        Ok(SharedQueueThreadPool { tx })
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            error!("every worker of the pool is gone, dropping the job");
        }
    }
}

/// The receiving end a worker thread runs jobs from. Respawns its thread if a job panics.
#[derive(Clone)]
struct Worker {
    id: u32,
    rx: Receiver<Job>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        if thread::panicking() {
            warn!(worker = self.id, "a job panicked, replacing the worker thread");
            if let Err(e) = spawn_worker(self.clone()) {
                error!("failed to respawn worker {}: {}", self.id, e);
            }
        }
    }
}

fn spawn_worker(worker: Worker) -> Result<()> {
    thread::Builder::new()
        .name(format!("kvs-worker-{}", worker.id))
        .spawn(move || run_jobs(worker))?;
    Ok(())
}

/// runs jobs until the pool, and with it the sending half of the channel, is dropped
fn run_jobs(worker: Worker) {
    while let Ok(job) = worker.rx.recv() {
        job();
    }
    debug!(worker = worker.id, "pool dropped, worker exiting");
}
