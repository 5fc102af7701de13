//! Thread pools a [`KvsServer`](crate::KvsServer) services its connections on.
//!
//! A connection occupies its worker for as long as the client keeps it open, and a streamed
//! range holds the worker until the last record is written.
use crate::Result;

/// The functionality a pool of worker threads must provide.
pub trait ThreadPool {
    /// creates a pool with `threads` worker threads
    ///
    /// # Errors
    /// returns an error if a thread could not be spawned, or `threads` is zero
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// runs `job` on one of the pool's threads
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}

mod rayon_pool;
mod shared_queue;

pub use self::rayon_pool::RayonThreadPool;
pub use self::shared_queue::SharedQueueThreadPool;
