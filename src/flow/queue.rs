//! An ordered sequence of [cells](super::cell) shared by exactly one producer and one consumer.
//!
//! The queue keeps two lists, a write side and a read side, that hold the two halves of the
//! same cells at corresponding positions. Settling the head of the write side therefore settles
//! the cell that sits (or sat) at the head of the read side. The Nth [`Consumer::read`] always
//! observes the Nth [`Producer::write`], regardless of which of the two happened first.
//!
//! Values travel as `Option<T>`: `None` is the sentinel written by [`Producer::finish`], and
//! every read issued after it resolves to `None` as well.
//!
//! Neither half is `Clone`, so one queue can never have two producers or two consumers.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use super::cell::{cell, Awaiter, Settler};
use crate::KvsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// the producer may still write
    Open,
    /// the sentinel was written
    Finished,
    /// the producer failed the queue; the error went to exactly one read
    Failed,
    /// one of the halves went away before the sentinel
    Closed,
}

struct Lists<T: Send + 'static> {
    write: VecDeque<Settler<Option<T>>>,
    read: VecDeque<Awaiter<Option<T>>>,
    phase: Phase,
    writes: u64,
    reads: u64,
}

impl<T: Send + 'static> Lists<T> {
    /// appends a fresh, unsettled cell to both sides
    fn prepare(&mut self) {
        let (settler, awaiter) = cell();
        self.write.push_back(settler);
        self.read.push_back(awaiter);
    }

    /// Moves the queue into a terminal phase, returning every cell that can no longer be
    /// written. Dropping the returned settlers rejects their cells with [`KvsError::Closed`].
    fn terminate(&mut self, phase: Phase) -> Vec<Settler<Option<T>>> {
        if self.phase != Phase::Open {
            return Vec::new();
        }
        self.phase = phase;
        self.write.drain(..).collect()
    }
}

struct Shared<T: Send + 'static> {
    lists: Mutex<Lists<T>>,
}

impl<T: Send + 'static> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Lists<T>> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// creates a new queue, returning its producing and consuming halves
pub fn queue<T: Send + 'static>() -> (Producer<T>, Consumer<T>) {
    let mut lists = Lists {
        write: VecDeque::new(),
        read: VecDeque::new(),
        phase: Phase::Open,
        writes: 0,
        reads: 0,
    };
    // one slot is always ready for the producer
    lists.prepare();

    let shared = Arc::new(Shared {
        lists: Mutex::new(lists),
    });
    (
        Producer {
            shared: Arc::clone(&shared),
        },
        Consumer { shared },
    )
}

/// The writing half of a queue.
///
/// Dropping a producer that has not called [`finish`](Producer::finish) or
/// [`fail`](Producer::fail) closes the queue: every outstanding and later read fails with
/// [`KvsError::Closed`] instead of waiting forever.
pub struct Producer<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Producer<T> {
    /// Settles the next cell with `value`. Never blocks.
    ///
    /// Writes to a queue that is no longer open are discarded.
    pub fn write(&mut self, value: T) {
        let mut lists = self.shared.lock();
        if lists.phase != Phase::Open {
            trace!(phase = ?lists.phase, "discarding write to a terminated queue");
            return;
        }
        let head = match lists.write.pop_front() {
            Some(head) => head,
            None => return,
        };
        lists.writes += 1;
        if lists.write.is_empty() {
            lists.prepare();
        }
        drop(lists);

        head.resolve(Some(value));
    }

    /// Settles the next cell with `err` and fails the queue.
    ///
    /// Only the read paired with this call observes `err`; reads after it observe
    /// [`KvsError::Closed`].
    pub fn fail(&mut self, err: KvsError) {
        let mut lists = self.shared.lock();
        let mut rest = lists.terminate(Phase::Failed);
        drop(lists);

        if !rest.is_empty() {
            let head = rest.remove(0);
            head.reject(err);
        }
    }

    /// Writes the sentinel: this read and every later one resolves to `None`.
    pub fn finish(&mut self) {
        let mut lists = self.shared.lock();
        let rest = lists.terminate(Phase::Finished);
        drop(lists);

        for settler in rest {
            settler.resolve(None);
        }
    }

    /// `true` while the queue still accepts writes
    pub fn is_open(&self) -> bool {
        self.shared.lock().phase == Phase::Open
    }

    /// the number of values written that the consumer has not yet asked for
    pub fn buffered(&self) -> u64 {
        let lists = self.shared.lock();
        lists.writes.saturating_sub(lists.reads)
    }
}

impl<T: Send + 'static> Drop for Producer<T> {
    fn drop(&mut self) {
        let rest = self.shared.lock().terminate(Phase::Closed);
        drop(rest);
    }
}

/// The reading half of a queue.
///
/// Dropping the consumer (or calling [`close`](Consumer::close)) abandons the queue: later
/// writes are discarded and any cell still waiting on a write is rejected with
/// [`KvsError::Closed`].
pub struct Consumer<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Consumer<T> {
    /// Returns the cell paired with the next write.
    ///
    /// A read issued before its write resolves once that write happens. Reads after the
    /// sentinel resolve to `None`; reads after a failure or close resolve to
    /// [`KvsError::Closed`].
    pub fn read(&mut self) -> Awaiter<Option<T>> {
        let mut lists = self.shared.lock();
        lists.reads += 1;
        if let Some(head) = lists.read.pop_front() {
            return head;
        }

        match lists.phase {
            Phase::Open => {
                lists.prepare();
                match lists.read.pop_front() {
                    Some(head) => head,
                    None => Awaiter::ready(Err(KvsError::Closed)),
                }
            }
            Phase::Finished => Awaiter::ready(Ok(None)),
            Phase::Failed | Phase::Closed => Awaiter::ready(Err(KvsError::Closed)),
        }
    }

    /// the number of reads issued so far
    pub fn reads(&self) -> u64 {
        self.shared.lock().reads
    }

    /// Abandons the queue. Idempotent.
    pub fn close(&mut self) {
        let mut lists = self.shared.lock();
        let rest = lists.terminate(Phase::Closed);
        let unread: Vec<_> = lists.read.drain(..).collect();
        drop(lists);

        drop(rest);
        drop(unread);
    }
}

impl<T: Send + 'static> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.close();
    }
}
