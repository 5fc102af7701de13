//! A lazy, one-item-at-a-time [`Source`] over a deferred collection.
//!
//! The collection is requested on the first pull, not before. Pulls that arrive while it is
//! being resolved are answered in order as soon as it settles.
use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::cell::{cell, Awaiter, Settler};
use super::pipe::Source;
use crate::Result;

type Request<T> = Box<dyn FnOnce() -> Awaiter<Vec<T>> + Send + 'static>;

enum Phase<T: Send + 'static> {
    /// nobody pulled yet
    Idle(Request<T>),
    /// the collection was requested and has not settled
    Resolving,
    /// the collection settled, items are handed out from `items`
    Ready,
    /// every item was handed out, or the request failed
    Ended,
}

struct State<T: Send + 'static> {
    phase: Phase<T>,
    items: VecDeque<T>,
    waiting: VecDeque<Settler<Option<T>>>,
}

/// Turns a deferred `Vec<T>` into a [`Source<T>`].
pub struct Promised<T: Send + 'static> {
    state: Arc<Mutex<State<T>>>,
}

impl<T: Send + 'static> Promised<T> {
    /// Creates a source whose items come from `request`, which is called on the first pull.
    pub fn new<F>(request: F) -> Self
    where
        F: FnOnce() -> Awaiter<Vec<T>> + Send + 'static,
    {
        Promised {
            state: Arc::new(Mutex::new(State {
                phase: Phase::Idle(Box::new(request)),
                items: VecDeque::new(),
                waiting: VecDeque::new(),
            })),
        }
    }

    /// creates a source over a collection that is already being resolved
    pub fn from_awaiter(awaiter: Awaiter<Vec<T>>) -> Self {
        Self::new(move || awaiter)
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        lock(&self.state)
    }
}

fn lock<T: Send + 'static>(state: &Mutex<State<T>>) -> MutexGuard<'_, State<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands the resolved collection (or its error) to the pulls that were waiting for it.
fn settle<T: Send + 'static>(state: &Mutex<State<T>>, result: Result<Vec<T>>) {
    let mut guard = lock(state);
    let waiting: Vec<_> = guard.waiting.drain(..).collect();

    match result {
        Ok(items) => {
            debug!(items = items.len(), "deferred collection resolved");
            guard.items = items.into();
            guard.phase = Phase::Ready;
            let answers: Vec<_> = waiting
                .into_iter()
                .map(|settler| (settler, guard.items.pop_front()))
                .collect();
            if guard.items.is_empty() {
                guard.phase = Phase::Ended;
            }
            drop(guard);

            for (settler, item) in answers {
                settler.resolve(item);
            }
        }
        Err(e) => {
            debug!("deferred collection failed: {}", e);
            guard.phase = Phase::Ended;
            drop(guard);

            let mut waiting = waiting.into_iter();
            if let Some(first) = waiting.next() {
                first.reject(e);
            }
            for rest in waiting {
                rest.resolve(None);
            }
        }
    }
}

impl<T: Send + 'static> Source<T> for Promised<T> {
    fn pull(&mut self) -> Awaiter<Option<T>> {
        let mut state = self.lock();
        match mem::replace(&mut state.phase, Phase::Resolving) {
            Phase::Idle(request) => {
                let (settler, awaiter) = cell();
                state.waiting.push_back(settler);
                drop(state);

                let shared = Arc::clone(&self.state);
                request().then(move |result| settle(&shared, result));
                awaiter
            }
            Phase::Resolving => {
                let (settler, awaiter) = cell();
                state.waiting.push_back(settler);
                awaiter
            }
            Phase::Ready => {
                let item = state.items.pop_front();
                state.phase = if state.items.is_empty() {
                    Phase::Ended
                } else {
                    Phase::Ready
                };
                Awaiter::ready(Ok(item))
            }
            Phase::Ended => {
                state.phase = Phase::Ended;
                Awaiter::ready(Ok(None))
            }
        }
    }
}
