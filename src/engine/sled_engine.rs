use std::ops::Bound;

use sled::{Batch, Db, IVec};
use tracing::debug;

use super::KvsEngine;
use crate::command::{BatchOp, Record};
use crate::error::{KvsError, Result};
use crate::options::RangeOptions;

/// A [`KvsEngine`] backed by the [`sled`] embedded database.
///
/// Every write is flushed before it is acknowledged.
///
/// [`sled`]: https://docs.rs/sled/latest/sled/
#[derive(Debug, Clone)]
pub struct SledKvsEngine(Db);

impl SledKvsEngine {
    /// wraps an already opened sled database
    pub fn new(db: Db) -> Self {
        SledKvsEngine(db)
    }
}

fn to_string(bytes: IVec) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| KvsError::Parsing(format!("stored bytes are not UTF-8: {}", e)))
}

fn as_bytes(bound: Bound<&str>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_bytes()),
        Bound::Excluded(key) => Bound::Excluded(key.as_bytes()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

impl KvsEngine for SledKvsEngine {
    fn get(&self, key: String) -> Result<Option<String>> {
        self.0.get(key)?.map(to_string).transpose()
    }

    fn put(&self, key: String, value: String) -> Result<()> {
        self.0.insert(key, value.into_bytes())?;
        self.0.flush()?;
        Ok(())
    }

    fn delete(&self, key: String) -> Result<()> {
        self.0.remove(key)?.ok_or(KvsError::KeyNotFound)?;
        self.0.flush()?;
        Ok(())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut batch = Batch::default();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => batch.insert(key.as_bytes(), value.into_bytes()),
                BatchOp::Del { key } => batch.remove(key.as_bytes()),
            }
        }
        self.0.apply_batch(batch)?;
        self.0.flush()?;
        Ok(())
    }

    fn range(&self, opts: &RangeOptions) -> Result<Vec<Record>> {
        if opts.is_empty() {
            return Ok(Vec::new());
        }
        let iter = self
            .0
            .range::<&[u8], _>((as_bytes(opts.lower()), as_bytes(opts.upper())));
        let pairs: Vec<(IVec, IVec)> = if opts.reverse {
            iter.rev().take(opts.take()).collect::<sled::Result<_>>()?
        } else {
            iter.take(opts.take()).collect::<sled::Result<_>>()?
        };
        debug!(records = pairs.len(), "sled range scanned");

        pairs
            .into_iter()
            .map(|(key, value)| {
                Ok(Record {
                    key: to_string(key)?,
                    value: to_string(value)?,
                })
            })
            .collect()
    }

    fn approximate_size(&self, from: &str, to: &str) -> Result<u64> {
        if from > to {
            return Ok(0);
        }
        let mut size = 0_u64;
        for pair in self.0.range::<&[u8], _>(from.as_bytes()..=to.as_bytes()) {
            let (key, value) = pair?;
            size += (key.len() + value.len()) as u64;
        }
        Ok(size)
    }
}
