//! The pull/push contract shared by the stream adapters, and the pump that moves items between
//! them while honoring backpressure.
//!
//! A [`Source`] hands out one item per [`pull`](Source::pull); a [`Sink`] accepts one item per
//! [`push`](Sink::push) and answers with a [`Flow`]. [`pipe`] connects the two: it pulls only
//! after the sink said it is ready for more, and stops pulling the moment it says
//! [`Flow::Saturated`] until [`Pipe::resume`] is called.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use super::cell::Awaiter;
use crate::{KvsError, Result};

/// A pull-based, one-item-at-a-time producer.
///
/// Each pull resolves to `Some(item)`, to `None` once the source is exhausted (and for every
/// pull after that), or to an error.
pub trait Source<T: Send + 'static>: Send + 'static {
    /// requests the next item
    fn pull(&mut self) -> Awaiter<Option<T>>;

    /// Converts the source into a blocking iterator, for synchronous callers.
    fn drain(self) -> Drain<T>
    where
        Self: Sized,
    {
        Drain {
            source: Box::new(self),
            done: false,
        }
    }
}

impl<T: Send + 'static> Source<T> for Box<dyn Source<T>> {
    fn pull(&mut self) -> Awaiter<Option<T>> {
        (**self).pull()
    }
}

/// What a [`Sink`] wants after accepting an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// keep the items coming
    Ready,
    /// stop pulling until the pipe is resumed
    Saturated,
}

/// A push-based consumer of items.
pub trait Sink<T>: Send + 'static {
    /// accepts one item
    fn push(&mut self, item: T) -> Flow;

    /// called once when the source is exhausted
    fn end(&mut self);

    /// called once when the source fails; no further calls follow
    fn error(&mut self, err: KvsError);
}

/// A blocking iterator over a [`Source`]. Yields at most one error, then stops.
pub struct Drain<T: Send + 'static> {
    source: Box<dyn Source<T>>,
    done: bool,
}

impl<T: Send + 'static> Iterator for Drain<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.source.pull().wait() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

type Ends<T> = (Box<dyn Source<T>>, Box<dyn Sink<T>>);

struct PipeState<T: Send + 'static> {
    /// `None` while a driver holds them, or once the pipe is closed
    ends: Option<Ends<T>>,
    /// a pull is parked on an unsettled cell
    in_flight: bool,
    paused: bool,
    /// a `resume` arrived while a driver held the ends
    wake: bool,
    closed: bool,
    pulls: u64,
}

/// Handle to a running pipe. Cloning the handle does not duplicate the pipe.
pub struct Pipe<T: Send + 'static> {
    state: Arc<Mutex<PipeState<T>>>,
}

impl<T: Send + 'static> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        Pipe {
            state: Arc::clone(&self.state),
        }
    }
}

/// Starts moving items from `source` into `sink`.
///
/// Items flow until the sink saturates, the source ends or fails, or the pipe is closed.
/// Continuations run on whichever thread settles the source's cells, so the sink must be
/// prepared to be called from the producer's thread.
pub fn pipe<T, S, K>(source: S, sink: K) -> Pipe<T>
where
    T: Send + 'static,
    S: Source<T>,
    K: Sink<T>,
{
    let pipe = Pipe {
        state: Arc::new(Mutex::new(PipeState {
            ends: Some((Box::new(source), Box::new(sink))),
            in_flight: false,
            paused: false,
            wake: false,
            closed: false,
            pulls: 0,
        })),
    };
    pipe.drive();
    pipe
}

enum Step {
    Continue,
    Pause,
    Stop,
}

fn deliver<T: 'static>(sink: &mut dyn Sink<T>, result: Result<Option<T>>) -> Step {
    match result {
        Ok(Some(item)) => match sink.push(item) {
            Flow::Ready => Step::Continue,
            Flow::Saturated => Step::Pause,
        },
        Ok(None) => {
            sink.end();
            Step::Stop
        }
        Err(e) => {
            sink.error(e);
            Step::Stop
        }
    }
}

impl<T: Send + 'static> Pipe<T> {
    fn lock(&self) -> MutexGuard<'_, PipeState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lets a saturated pipe pull again. Does nothing if the pipe is already flowing, or
    /// closed. Safe to call from inside a sink or a continuation.
    ///
    /// A resume that lands while a driver is between a saturated push and pausing is not lost:
    /// the driver keeps pulling instead of pausing.
    pub fn resume(&self) {
        let mut state = self.lock();
        if !state.paused {
            if state.ends.is_none() && !state.closed {
                state.wake = true;
            }
            return;
        }
        state.paused = false;
        drop(state);
        self.drive();
    }

    /// Stops the pipe and drops both ends. Idempotent.
    ///
    /// A pull parked on the source is released with the source; whatever it resolves to is
    /// discarded.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        let ends = state.ends.take();
        drop(state);
        drop(ends);
    }

    /// `true` once the source ended or failed, or the pipe was closed
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// `true` while the pipe waits for [`resume`](Pipe::resume)
    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// the number of pulls issued on the source so far
    pub fn pulls(&self) -> u64 {
        self.lock().pulls
    }

    /// Takes the ends and pulls until the pipe has to wait for something.
    fn drive(&self) {
        let (mut source, mut sink) = {
            let mut state = self.lock();
            if state.closed || state.paused || state.in_flight {
                return;
            }
            // someone else is driving
            match state.ends.take() {
                Some(ends) => ends,
                None => return,
            }
        };

        loop {
            let awaiter = source.pull();
            self.lock().pulls += 1;

            match awaiter.try_take() {
                Ok(result) => {
                    let step = deliver(&mut *sink, result);
                    if !self.settle_step(step, source, sink) {
                        return;
                    }
                    match self.lock().ends.take() {
                        Some((s, k)) => {
                            source = s;
                            sink = k;
                        }
                        None => return,
                    }
                }
                Err(awaiter) => {
                    trace!("pull is pending, parking the pipe on it");
                    {
                        let mut state = self.lock();
                        if state.closed {
                            return;
                        }
                        // the ends stay reachable from `close` while parked
                        state.in_flight = true;
                        state.wake = false;
                        state.ends = Some((source, sink));
                    }
                    let pipe = self.clone();
                    awaiter.then(move |result| pipe.land(result));
                    return;
                }
            }
        }
    }

    /// Delivers the result of a parked pull and resumes driving if the sink wants more.
    fn land(&self, result: Result<Option<T>>) {
        let (source, mut sink) = {
            let mut state = self.lock();
            state.in_flight = false;
            if state.closed {
                return;
            }
            match state.ends.take() {
                Some(ends) => ends,
                None => return,
            }
        };

        let step = deliver(&mut *sink, result);
        if self.settle_step(step, source, sink) {
            self.drive();
        }
    }

    /// Puts the ends back (or drops them) according to `step`. Returns `true` when the pipe
    /// should keep pulling.
    fn settle_step(&self, step: Step, source: Box<dyn Source<T>>, sink: Box<dyn Sink<T>>) -> bool {
        let mut state = self.lock();
        match step {
            _ if state.closed => false,
            Step::Stop => {
                state.closed = true;
                drop(state);
                drop((source, sink));
                false
            }
            Step::Pause if state.wake => {
                trace!("resumed while saturating, keep pulling");
                state.wake = false;
                state.ends = Some((source, sink));
                true
            }
            Step::Pause => {
                state.paused = true;
                state.ends = Some((source, sink));
                false
            }
            Step::Continue => {
                // the sink saw every read made before this push
                state.wake = false;
                state.ends = Some((source, sink));
                true
            }
        }
    }
}
