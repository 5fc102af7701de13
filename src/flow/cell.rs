//! A single-slot, settle-once handoff between one producer and one consumer.
//!
//! [`cell`] returns the two halves of the slot. The [`Settler`] is consumed when it settles the
//! slot, so a second settlement cannot be expressed. The [`Awaiter`] is consumed when a
//! continuation is attached (or when it is waited on), so a slot only ever has one consumer.
//!
//! A continuation attached after settlement runs immediately, on the attaching thread. A
//! continuation attached before settlement runs on whichever thread settles the slot.
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::{KvsError, Result};

type Continuation<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

enum State<T> {
    /// not yet settled, possibly with a continuation waiting for the result
    Pending(Option<Continuation<T>>),
    /// settled, but nobody has taken the result yet
    Settled(Result<T>),
    /// the result was handed to the consumer
    Taken,
}

struct Slot<T> {
    state: Mutex<State<T>>,
    settled: Condvar,
}

impl<T> Slot<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, result: Result<T>) {
        let mut state = self.lock();
        let continuation = match &mut *state {
            State::Pending(continuation) => continuation.take(),
            // settlers are consumed on use, so this is unreachable through the public API
            _ => return,
        };

        match continuation {
            Some(continuation) => {
                *state = State::Taken;
                drop(state);
                continuation(result);
            }
            None => {
                *state = State::Settled(result);
                drop(state);
                self.settled.notify_all();
            }
        }
    }
}

/// creates a new, unsettled cell and returns its producer and consumer halves
pub fn cell<T: Send + 'static>() -> (Settler<T>, Awaiter<T>) {
    let slot = Arc::new(Slot {
        state: Mutex::new(State::Pending(None)),
        settled: Condvar::new(),
    });
    (
        Settler {
            slot: Some(Arc::clone(&slot)),
        },
        Awaiter { slot },
    )
}

/// The producing half of a cell.
///
/// Dropping a `Settler` without settling it rejects the cell with [`KvsError::Closed`], so a
/// consumer never waits on a value that can no longer arrive.
pub struct Settler<T: Send + 'static> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T: Send + 'static> Settler<T> {
    /// settles the cell with a value
    pub fn resolve(self, value: T) {
        self.settle(Ok(value))
    }

    /// settles the cell with an error
    pub fn reject(self, err: KvsError) {
        self.settle(Err(err))
    }

    /// settles the cell with the given result
    pub fn settle(mut self, result: Result<T>) {
        if let Some(slot) = self.slot.take() {
            slot.settle(result);
        }
    }
}

impl<T: Send + 'static> Drop for Settler<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.settle(Err(KvsError::Closed));
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Settler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settler")
            .field("settled", &self.slot.is_none())
            .finish()
    }
}

/// The consuming half of a cell.
pub struct Awaiter<T: Send + 'static> {
    slot: Arc<Slot<T>>,
}

impl<T: Send + 'static> Awaiter<T> {
    /// returns an awaiter that is already settled with `result`
    pub fn ready(result: Result<T>) -> Self {
        Awaiter {
            slot: Arc::new(Slot {
                state: Mutex::new(State::Settled(result)),
                settled: Condvar::new(),
            }),
        }
    }

    /// `true` once the producer has settled the cell
    pub fn is_settled(&self) -> bool {
        matches!(*self.slot.lock(), State::Settled(_))
    }

    /// Registers `f` to be called exactly once with the settled result.
    ///
    /// If the cell is already settled `f` runs before `then` returns.
    pub fn then<F>(self, f: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let mut state = self.slot.lock();
        match std::mem::replace(&mut *state, State::Taken) {
            State::Settled(result) => {
                drop(state);
                f(result);
            }
            State::Pending(_) => *state = State::Pending(Some(Box::new(f))),
            State::Taken => {}
        }
    }

    /// Takes the result if the cell is already settled, otherwise hands the awaiter back.
    pub fn try_take(self) -> std::result::Result<Result<T>, Self> {
        let mut state = self.slot.lock();
        if let State::Settled(_) = *state {
            if let State::Settled(result) = std::mem::replace(&mut *state, State::Taken) {
                return Ok(result);
            }
        }
        drop(state);
        Err(self)
    }

    /// Blocks the current thread until the cell is settled.
    ///
    /// This is meant for synchronous callers sitting at the edge of the crate (binaries,
    /// tests, the server's response loop); the flow-control core itself never waits.
    pub fn wait(self) -> Result<T> {
        let mut state = self.slot.lock();
        loop {
            match std::mem::replace(&mut *state, State::Taken) {
                State::Settled(result) => return result,
                pending @ State::Pending(_) => {
                    *state = pending;
                    state = self
                        .slot
                        .settled
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                State::Taken => return Err(KvsError::Closed),
            }
        }
    }

    /// Returns an awaiter settled with `f` applied to this cell's result.
    ///
    /// When this cell is already settled, the returned awaiter is settled too.
    pub fn map<U, F>(self, f: F) -> Awaiter<U>
    where
        U: Send + 'static,
        F: FnOnce(Result<T>) -> Result<U> + Send + 'static,
    {
        let (settler, awaiter) = cell();
        self.then(move |result| settler.settle(f(result)));
        awaiter
    }
}

impl<T: Send + 'static> fmt::Debug for Awaiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Awaiter")
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn continuation_registered_before_settlement_fires_once() {
        let (settler, awaiter) = cell::<u32>();
        let (tx, rx) = mpsc::channel();
        awaiter.then(move |r| tx.send(r.unwrap()).unwrap());
        assert!(rx.try_recv().is_err());

        settler.resolve(7);
        assert_eq!(rx.try_recv().unwrap(), 7);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn continuation_registered_after_settlement_replays() {
        let (settler, awaiter) = cell::<&'static str>();
        settler.resolve("late");
        assert!(awaiter.is_settled());

        let (tx, rx) = mpsc::channel();
        awaiter.then(move |r| tx.send(r.unwrap()).unwrap());
        assert_eq!(rx.try_recv().unwrap(), "late");
    }

    #[test]
    fn rejection_reaches_the_consumer() {
        let (settler, awaiter) = cell::<u32>();
        settler.reject(KvsError::StringErr("boom".to_owned()));
        match awaiter.wait() {
            Err(KvsError::StringErr(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn dropped_settler_rejects_with_closed() {
        let (settler, awaiter) = cell::<u32>();
        drop(settler);
        assert!(matches!(awaiter.wait(), Err(KvsError::Closed)));
    }

    #[test]
    fn try_take_hands_back_pending_awaiter() {
        let (settler, awaiter) = cell::<u32>();
        let awaiter = awaiter.try_take().expect_err("cell is still pending");
        settler.resolve(3);
        assert_eq!(awaiter.try_take().ok().unwrap().unwrap(), 3);
    }

    #[test]
    fn wait_blocks_until_settled_from_another_thread() {
        let (settler, awaiter) = cell::<String>();
        let handle = thread::spawn(move || settler.resolve("from afar".to_owned()));
        assert_eq!(awaiter.wait().unwrap(), "from afar");
        handle.join().unwrap();
    }

    #[test]
    fn map_of_settled_cell_is_settled() {
        let mapped = Awaiter::ready(Ok(20)).map(|r| r.map(|v: i32| v + 1));
        assert!(mapped.is_settled());
        assert_eq!(mapped.wait().unwrap(), 21);
    }
}
