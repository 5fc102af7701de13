//! A bidirectional, flow-controlled stream built on one [`queue`](super::queue).
//!
//! The writable face ([`DuplexWriter`]) accepts single items or small batches and never blocks.
//! The readable face ([`DuplexReader`]) is a [`Source`]: it issues exactly one queue read per
//! pull, so a reader that stops pulling (for example a [`pipe`](super::pipe::pipe) whose sink
//! saturated) stops draining the queue.
//!
//! Reaching the end of the stream, or an error on either face, closes both faces.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::cell::Awaiter;
use super::pipe::Source;
use super::queue::{queue, Consumer, Producer};
use crate::{KvsError, Result};

/// One write: a single item, or a batch written element by element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk<T> {
    /// a single item
    One(T),
    /// several items, written in order
    Many(Vec<T>),
}

impl<T> From<Vec<T>> for Chunk<T> {
    fn from(items: Vec<T>) -> Self {
        Chunk::Many(items)
    }
}

/// shared close flag of the two faces
#[derive(Debug, Default)]
struct Link {
    closed: AtomicBool,
}

impl Link {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("duplex stream closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// creates a new duplex stream and returns its writable and readable faces
pub fn duplex<T: Send + 'static>() -> (DuplexWriter<T>, DuplexReader<T>) {
    let (producer, consumer) = queue();
    let link = Arc::new(Link::default());
    (
        DuplexWriter {
            producer,
            link: Arc::clone(&link),
            ended: false,
        },
        DuplexReader { consumer, link },
    )
}

/// The writable face of a duplex stream.
///
/// Dropping the writer without calling [`end`](DuplexWriter::end) makes the reader fail with
/// [`KvsError::Closed`] rather than see a truncated stream as complete.
pub struct DuplexWriter<T: Send + 'static> {
    producer: Producer<T>,
    link: Arc<Link>,
    ended: bool,
}

impl<T: Send + 'static> DuplexWriter<T> {
    /// writes one item
    ///
    /// # Errors
    /// returns [`KvsError::Closed`] once either face has closed
    pub fn write(&mut self, item: T) -> Result<()> {
        self.check_open()?;
        self.producer.write(item);
        Ok(())
    }

    /// writes a chunk, one element at a time
    pub fn write_chunk(&mut self, chunk: Chunk<T>) -> Result<()> {
        match chunk {
            Chunk::One(item) => self.write(item),
            Chunk::Many(items) => items.into_iter().try_for_each(|item| self.write(item)),
        }
    }

    /// writes several chunks, preserving the order of every element
    pub fn writev<I>(&mut self, chunks: I) -> Result<()>
    where
        I: IntoIterator<Item = Chunk<T>>,
    {
        chunks
            .into_iter()
            .try_for_each(|chunk| self.write_chunk(chunk))
    }

    /// Signals that no more items follow. Idempotent.
    pub fn end(&mut self) {
        if !self.ended {
            self.ended = true;
            self.producer.finish();
        }
    }

    /// Fails the stream: the reader's next pull observes `err`, and both faces close.
    pub fn abort(&mut self, err: KvsError) {
        self.ended = true;
        self.link.close();
        self.producer.fail(err);
    }

    /// `true` once either face has closed or the writer ended
    pub fn is_closed(&self) -> bool {
        self.ended || self.link.is_closed() || !self.producer.is_open()
    }

    /// the number of written items the reader has not pulled yet
    pub fn buffered(&self) -> u64 {
        self.producer.buffered()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(KvsError::Closed)
        } else {
            Ok(())
        }
    }
}

/// The readable face of a duplex stream.
pub struct DuplexReader<T: Send + 'static> {
    consumer: Consumer<T>,
    link: Arc<Link>,
}

impl<T: Send + 'static> DuplexReader<T> {
    /// Closes both faces. Idempotent.
    pub fn close(&mut self) {
        self.link.close();
        self.consumer.close();
    }

    /// `true` once either face has closed
    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    /// the number of pulls issued so far
    pub fn pulls(&self) -> u64 {
        self.consumer.reads()
    }
}

impl<T: Send + 'static> Source<T> for DuplexReader<T> {
    fn pull(&mut self) -> Awaiter<Option<T>> {
        let link = Arc::clone(&self.link);
        self.consumer.read().map(move |result| {
            if !matches!(result, Ok(Some(_))) {
                link.close();
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull_now<T: Send + 'static>(reader: &mut DuplexReader<T>) -> Result<Option<T>> {
        reader
            .pull()
            .try_take()
            .unwrap_or_else(|_| panic!("expected a settled pull"))
    }

    #[test]
    fn chunks_are_flattened_in_order() {
        let (mut writer, reader) = duplex();
        writer
            .writev(vec![Chunk::One(1), Chunk::Many(vec![2, 3]), Chunk::One(4)])
            .unwrap();
        writer.write_chunk(vec![5, 6].into()).unwrap();
        writer.end();

        let items: Vec<_> = reader.drain().map(|r| r.unwrap()).collect();
        assert_eq!(items, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn end_of_stream_closes_both_faces() {
        let (mut writer, mut reader) = duplex();
        writer.write("only").unwrap();
        writer.end();
        writer.end();

        assert_eq!(pull_now(&mut reader).unwrap(), Some("only"));
        assert!(!reader.is_closed());
        assert_eq!(pull_now(&mut reader).unwrap(), None);
        assert!(reader.is_closed());
        assert_eq!(pull_now(&mut reader).unwrap(), None);
        assert!(matches!(writer.write("late"), Err(KvsError::Closed)));
    }

    #[test]
    fn abort_is_observed_by_the_next_pull() {
        let (mut writer, mut reader) = duplex::<u8>();
        writer.write(1).unwrap();
        writer.abort(KvsError::StringErr("decoder failed".to_owned()));

        assert_eq!(pull_now(&mut reader).unwrap(), Some(1));
        match pull_now(&mut reader) {
            Err(KvsError::StringErr(msg)) => assert_eq!(msg, "decoder failed"),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(reader.is_closed());
    }

    #[test]
    fn closing_the_reader_rejects_writes() {
        let (mut writer, mut reader) = duplex::<u8>();
        reader.close();
        reader.close();
        assert!(writer.is_closed());
        assert!(matches!(writer.write(1), Err(KvsError::Closed)));
    }

    #[test]
    fn dropped_writer_is_an_error_not_an_end() {
        let (writer, mut reader) = duplex::<u8>();
        drop(writer);
        assert!(matches!(pull_now(&mut reader), Err(KvsError::Closed)));
    }

    #[test]
    fn reader_only_pulls_when_asked() {
        let (mut writer, mut reader) = duplex();
        for v in 0..8 {
            writer.write(v).unwrap();
        }
        assert_eq!(reader.pulls(), 0);
        assert_eq!(writer.buffered(), 8);
        assert_eq!(pull_now(&mut reader).unwrap(), Some(0));
        assert_eq!(reader.pulls(), 1);
        assert_eq!(writer.buffered(), 7);
    }
}
