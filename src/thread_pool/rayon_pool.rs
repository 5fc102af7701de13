use tracing::debug;

use super::ThreadPool;
use crate::{KvsError, Result};

/// A thread pool that uses a work stealing strategy as implemented by the [`Rayon`] library.
///
/// [`Rayon`]: https://docs.rs/rayon/latest/rayon/index.html
#[derive(Debug)]
pub struct RayonThreadPool {
    pool: rayon::ThreadPool,
}

impl ThreadPool for RayonThreadPool {
    fn new(threads: u32) -> Result<Self> {
        if threads == 0 {
            return Err(KvsError::Parsing("a pool needs at least one thread".to_owned()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads as usize)
            .thread_name(|i| format!("kvs-rayon-{}", i))
            .build()
            .map_err(|e| KvsError::StringErr(format!("could not build thread pool: {:?}", e)))?;
        debug!("created rayon pool with {} threads", threads);

        Ok(RayonThreadPool { pool })
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // `install` would block the accept loop until the connection closes
        self.pool.spawn(job);
    }
}
