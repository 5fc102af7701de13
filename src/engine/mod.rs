//! This module provides the key/value storage engine implementations a server can be backed by.
//! The two engines that are implemented are [`KvStore`], a log-structured store, and a wrapper
//! around the [`sled`] database engine.
//!
//! [`sled`]: https://docs.rs/sled/latest/sled/
use crate::command::{BatchOp, Record};
use crate::flow::{Awaiter, Promised};
use crate::iterator::StreamIterator;
use crate::options::RangeOptions;
use crate::Result;

/// A trait for the functionality of a key/value storage engine
pub trait KvsEngine: Clone + Send + 'static {
    /// Gets the value associated with the given `key`
    ///
    /// Returns `None` if the given `key` does not exist.
    fn get(&self, key: String) -> Result<Option<String>>;

    /// sets a `key` and `value`
    ///
    /// If the given `key` already exists the previous `value` will be overwritten.
    fn put(&self, key: String, value: String) -> Result<()>;

    /// Removes the given `key` (and associated value) from the store
    ///
    /// # Errors
    ///
    /// Returns `KvsError::KeyNotFound` if the given `key` is not found.
    fn delete(&self, key: String) -> Result<()>;

    /// Applies the operations in order. Deleting a missing key is not an error here.
    fn batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    /// Returns the records whose keys fall within `opts`, in key order (descending when
    /// `opts.reverse` is set), at most `opts.limit` of them.
    fn range(&self, opts: &RangeOptions) -> Result<Vec<Record>>;

    /// Estimates the number of bytes used by the keys in `from..=to`.
    fn approximate_size(&self, from: &str, to: &str) -> Result<u64>;

    /// Opens a cursor over a local range, through the same bridge a remote range uses.
    ///
    /// The scan itself runs on the first `next`.
    fn iterator(&self, opts: RangeOptions) -> Result<StreamIterator> {
        let engine = self.clone();
        StreamIterator::open(opts, move |transport| {
            let transport = transport.clone();
            Ok(Promised::new(move || {
                Awaiter::ready(engine.range(&transport))
            }))
        })
    }
}

mod kvs;
mod sled_engine;

pub use self::kvs::KvStore;
pub use self::sled_engine::SledKvsEngine;
