//! The cursor contract of a key/value engine, and [`StreamIterator`], which satisfies it on top
//! of a streamed result set.
//!
//! A storage engine's native cursor is pull based: the caller asks for one entry with
//! [`KvIterator::next`] and releases the cursor with [`KvIterator::end`]. A remote range, on the
//! other hand, arrives as records pushed by a transport. `StreamIterator` pipes that stream into
//! an internal [`queue`](crate::flow::queue) (bounded by [`HIGH_WATER_MARK`]) and answers every
//! `next` with the record paired with it, after applying the key/value projection locally.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::command::{Entry, Record};
use crate::flow::{cell, pipe, queue, Consumer, Flow, Pipe, Producer, Sink, Source};
use crate::options::RangeOptions;
use crate::{KvsError, Result};

/// the number of records buffered ahead of `next` before the stream is paused
pub const HIGH_WATER_MARK: u64 = 16;

/// callback of [`KvIterator::next`]: an entry, `None` at the end of the iteration, or an error
pub type NextCallback = Box<dyn FnOnce(Result<Option<Entry>>) + Send + 'static>;

/// callback of [`KvIterator::end`]
pub type EndCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// The pull-based cursor a key/value engine exposes for range iteration.
pub trait KvIterator {
    /// Advances the cursor and hands the entry at that position to `callback`.
    ///
    /// At the end of the iteration `callback` receives `Ok(None)`, and keeps receiving it on
    /// every later call.
    fn next(&mut self, callback: NextCallback);

    /// Releases the cursor. No `next` may follow.
    fn end(&mut self, callback: EndCallback);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// the stream may still deliver records
    Open,
    /// the stream finished; buffered records remain
    Draining,
    /// the end of the iteration was observed, or `end` was called
    Ended,
    /// a read failed; the error went to one `next` callback
    Errored,
}

struct Status {
    phase: Phase,
    /// `end` was called by the user
    released: bool,
}

fn lock(status: &Mutex<Status>) -> MutexGuard<'_, Status> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Writes piped records into the iterator's queue, saturating at [`HIGH_WATER_MARK`].
struct QueueSink {
    producer: Producer<Record>,
    status: Arc<Mutex<Status>>,
}

impl Sink<Record> for QueueSink {
    fn push(&mut self, record: Record) -> Flow {
        self.producer.write(record);
        if self.producer.buffered() >= HIGH_WATER_MARK {
            trace!("iterator buffer is full, pausing the stream");
            Flow::Saturated
        } else {
            Flow::Ready
        }
    }

    fn end(&mut self) {
        {
            let mut status = lock(&self.status);
            if status.phase == Phase::Open {
                status.phase = Phase::Draining;
            }
        }
        self.producer.finish();
    }

    fn error(&mut self, err: KvsError) {
        debug!("record stream failed: {}", err);
        self.producer.fail(err);
    }
}

/// Adapts a streamed result set to the [`KvIterator`] contract.
pub struct StreamIterator {
    consumer: Consumer<Record>,
    pipe: Pipe<Record>,
    status: Arc<Mutex<Status>>,
    keys: bool,
    values: bool,
}

impl StreamIterator {
    /// Opens an iterator over the records `open` streams for the given options.
    ///
    /// The `start`/`end` aliases are rewritten to `gte`/`lte`, and the options handed to
    /// `open` always ask for both keys and values: projection happens here, not at the source.
    pub fn open<S, F>(opts: RangeOptions, open: F) -> Result<StreamIterator>
    where
        S: Source<Record>,
        F: FnOnce(&RangeOptions) -> Result<S>,
    {
        let mut opts = opts.normalized();
        let (keys, values) = (opts.keys, opts.values);
        opts.keys = true;
        opts.values = true;

        let source = open(&opts)?;
        Ok(Self::from_source(source, keys, values))
    }

    /// Builds an iterator over an already open stream.
    pub fn from_source<S: Source<Record>>(source: S, keys: bool, values: bool) -> StreamIterator {
        let (producer, consumer) = queue();
        let status = Arc::new(Mutex::new(Status {
            phase: Phase::Open,
            released: false,
        }));
        let sink = QueueSink {
            producer,
            status: Arc::clone(&status),
        };
        let pipe = pipe(source, sink);

        StreamIterator {
            consumer,
            pipe,
            status,
            keys,
            values,
        }
    }

    /// `true` once the end of the iteration was observed, `end` was called, or a read failed
    pub fn is_ended(&self) -> bool {
        matches!(lock(&self.status).phase, Phase::Ended | Phase::Errored)
    }

    /// `true` once the stream finished but buffered records have not all been read
    pub fn is_draining(&self) -> bool {
        lock(&self.status).phase == Phase::Draining
    }

    /// the number of records pulled from the underlying stream so far
    pub fn pulled(&self) -> u64 {
        self.pipe.pulls()
    }

    /// Converts the iterator into a blocking [`Iterator`] of entries.
    pub fn entries(self) -> Entries {
        Entries {
            inner: self,
            done: false,
        }
    }

    fn project(&self) -> impl Fn(Record) -> Entry {
        let (keys, values) = (self.keys, self.values);
        move |record| Entry {
            key: if keys { Some(record.key) } else { None },
            value: if values { Some(record.value) } else { None },
        }
    }
}

impl KvIterator for StreamIterator {
    fn next(&mut self, callback: NextCallback) {
        let streaming = {
            let status = lock(&self.status);
            if status.released {
                drop(status);
                return callback(Err(KvsError::IteratorClosed));
            }
            match status.phase {
                Phase::Ended => {
                    drop(status);
                    return callback(Ok(None));
                }
                Phase::Errored => {
                    drop(status);
                    return callback(Err(KvsError::Closed));
                }
                Phase::Open => true,
                Phase::Draining => false,
            }
        };

        let awaiter = self.consumer.read();
        let status = Arc::clone(&self.status);
        let pipe = self.pipe.clone();
        let project = self.project();
        awaiter.then(move |result| match result {
            Ok(Some(record)) => callback(Ok(Some(project(record)))),
            Ok(None) => {
                lock(&status).phase = Phase::Ended;
                callback(Ok(None))
            }
            Err(e) => {
                lock(&status).phase = Phase::Errored;
                pipe.close();
                callback(Err(e))
            }
        });

        // a slot opened up in the buffer; once draining, nothing is left to pull
        if streaming {
            self.pipe.resume();
        }
    }

    fn end(&mut self, callback: EndCallback) {
        {
            let mut status = lock(&self.status);
            status.released = true;
            if status.phase != Phase::Errored {
                status.phase = Phase::Ended;
            }
        }
        self.pipe.close();
        self.consumer.close();
        callback(Ok(()))
    }
}

impl Drop for StreamIterator {
    fn drop(&mut self) {
        self.pipe.close();
    }
}

/// A blocking iterator over the entries of a [`StreamIterator`].
///
/// Yields at most one error, then stops. The cursor is ended when the iteration completes.
pub struct Entries {
    inner: StreamIterator,
    done: bool,
}

impl Iterator for Entries {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let (settler, awaiter) = cell();
        KvIterator::next(&mut self.inner, Box::new(move |result| settler.settle(result)));

        let item = match awaiter.wait() {
            Ok(Some(entry)) => return Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        };
        self.done = true;
        self.inner.end(Box::new(|_| {}));
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{duplex, Promised};
    use crate::flow::Awaiter;
    use std::sync::mpsc;

    fn next_now(it: &mut StreamIterator) -> Result<Option<Entry>> {
        let (tx, rx) = mpsc::channel();
        it.next(Box::new(move |r| tx.send(r).unwrap()));
        rx.try_recv().expect("next should have answered synchronously")
    }

    fn entry(key: Option<&str>, value: Option<&str>) -> Entry {
        Entry {
            key: key.map(String::from),
            value: value.map(String::from),
        }
    }

    #[test]
    fn duplex_records_drain_through_the_iterator() {
        let (mut writer, reader) = duplex();
        writer.write(Record::new("a", "1")).unwrap();
        writer.write(Record::new("b", "2")).unwrap();
        writer.end();

        let mut it = StreamIterator::open(RangeOptions::default(), |_| Ok(reader)).unwrap();
        assert!(it.is_draining());
        assert_eq!(next_now(&mut it).unwrap(), Some(entry(Some("a"), Some("1"))));
        assert_eq!(next_now(&mut it).unwrap(), Some(entry(Some("b"), Some("2"))));
        assert!(it.is_draining());
        assert_eq!(next_now(&mut it).unwrap(), None);
        assert!(!it.is_draining());
        assert_eq!(next_now(&mut it).unwrap(), None);
        assert!(it.is_ended());
    }

    #[test]
    fn projection_is_applied_locally() {
        let mut seen = None;
        let opts = RangeOptions {
            keys: false,
            start: Some("a".to_owned()),
            ..RangeOptions::default()
        };
        let source = Promised::from_awaiter(Awaiter::ready(Ok(vec![Record::new("a", "b")])));
        let mut it = StreamIterator::open(opts, |transport: &RangeOptions| {
            seen = Some(transport.clone());
            Ok(source)
        })
        .unwrap();

        let transport = seen.unwrap();
        assert!(transport.keys && transport.values);
        assert_eq!(transport.gte.as_deref(), Some("a"));
        assert!(transport.start.is_none());

        assert_eq!(next_now(&mut it).unwrap(), Some(entry(None, Some("b"))));
    }

    #[test]
    fn next_waits_for_records_that_arrive_later() {
        let (mut writer, reader) = duplex();
        let mut it = StreamIterator::from_source(reader, true, false);

        let (tx, rx) = mpsc::channel();
        it.next(Box::new(move |r| tx.send(r).unwrap()));
        assert!(rx.try_recv().is_err());

        writer.write(Record::new("late", "x")).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), Some(entry(Some("late"), None)));
    }

    #[test]
    fn stream_failure_is_reported_by_next_not_as_an_end() {
        let (mut writer, reader) = duplex();
        writer.write(Record::new("a", "1")).unwrap();
        writer.abort(KvsError::StringErr("connection reset".to_owned()));

        let mut it = StreamIterator::from_source(reader, true, true);
        assert!(next_now(&mut it).unwrap().is_some());
        match next_now(&mut it) {
            Err(KvsError::StringErr(msg)) => assert_eq!(msg, "connection reset"),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(it.is_ended());
        assert!(matches!(next_now(&mut it), Err(KvsError::Closed)));
    }

    #[test]
    fn buffer_is_bounded_by_the_high_water_mark() {
        let (mut writer, reader) = duplex();
        for i in 0..100 {
            writer.write(Record::new(format!("k{:03}", i), "v")).unwrap();
        }
        writer.end();

        let mut it = StreamIterator::from_source(reader, true, true);
        assert_eq!(it.pulled(), HIGH_WATER_MARK);
        assert_eq!(writer.buffered(), 100 - HIGH_WATER_MARK);

        next_now(&mut it).unwrap();
        assert_eq!(it.pulled(), HIGH_WATER_MARK + 1);
    }

    #[test]
    fn end_releases_the_stream_and_rejects_later_next() {
        let (mut writer, reader) = duplex();
        writer.write(Record::new("a", "1")).unwrap();
        let mut it = StreamIterator::from_source(reader, true, true);

        let (tx, rx) = mpsc::channel();
        it.end(Box::new(move |r| tx.send(r).unwrap()));
        assert!(rx.try_recv().unwrap().is_ok());
        assert!(matches!(next_now(&mut it), Err(KvsError::IteratorClosed)));
        assert!(matches!(writer.write(Record::new("b", "2")), Err(KvsError::Closed)));
    }

    #[test]
    fn entries_collects_until_the_end() {
        let records = vec![Record::new("x", "1"), Record::new("y", "2")];
        let source = Promised::from_awaiter(Awaiter::ready(Ok(records)));
        let it = StreamIterator::from_source(source, true, true);
        let entries: Vec<_> = it.entries().map(|e| e.unwrap()).collect();
        assert_eq!(
            entries,
            vec![entry(Some("x"), Some("1")), entry(Some("y"), Some("2"))]
        );
    }
}
