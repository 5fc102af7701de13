#![deny(missing_docs)]
//! A remote, persistent key-value store that maps [`String`] keys to [`String`] values, and the
//! flow-control layer that lets a range streamed over the network be consumed like a local
//! storage cursor.
//!
//! This crate provides the storage engines, a [`KvsServer`] and a [`KvsClient`] that talk a
//! JSON protocol over TCP, and a `kvs-client` and `kvs-server` executable built on them.
//!
//! ## Supported Storage Operations
//! - `GET`, `PUT` and `DELETE` a single key
//! - `BATCH` several puts and deletes
//! - `RANGE` over the keys within bounds, in either order, with an optional limit
//! - `APPROXIMATE SIZE` of a key range
//! - `META` returns a document configured on the server
//!
//! A server configured with [`Credentials`] requires every connection to `LOGIN` first.
//!
//! ## Flow control
//! The [`flow`] module turns push-style delivery into pull-style consumption:
//! - a [`cell`](flow::cell) hands one value or error from a producer to a consumer
//! - a [`queue`](flow::queue) pairs the Nth write with the Nth read, whichever comes first
//! - a [`duplex`](flow::duplex) stream is a queue with a writable and a readable face
//! - [`Promised`](flow::Promised) turns a deferred list into a lazy sequence
//! - a [`pipe`](flow::pipe) moves items from a source into a sink and stops pulling while the
//!   sink is saturated
//!
//! [`StreamIterator`] puts those together: it satisfies the [`KvIterator`] contract of a storage
//! cursor (`next` / `end`) on top of records streamed by the client's transport thread, and
//! never buffers more than [`HIGH_WATER_MARK`](iterator::HIGH_WATER_MARK) records ahead of the
//! caller. Local engines expose their ranges through the same bridge with
//! [`KvsEngine::iterator`].
//!
//! ## Custom Protocol
//! Every [`Request`] and [`Response`] is a JSON value, sent back to back over a `TcpStream`.
//! A range is answered with one `Record` response per record followed by `End`, or by `Err`.
//!
//! ## Command Log Files
//! [`KvStore`] persists puts and deletes into a series of "command log" files named after their
//! generation number (`1.log`, `2.log`, ...), and keeps an ordered in-memory index of where each
//! live value sits. Once enough stale data accumulates the logs are compacted.

pub use client::{KvsClient, RecordWriter};
pub use command::{BatchOp, Entry, Record, Request, Response};
pub use config::{Credentials, EngineKind, ServerConfig};
pub use engine::{KvStore, KvsEngine, SledKvsEngine};
pub use error::{KvsError, Result};
pub use iterator::{KvIterator, StreamIterator};
pub use options::RangeOptions;
pub use server::KvsServer;
pub use thread_pool::{RayonThreadPool, SharedQueueThreadPool, ThreadPool};

mod client;
mod command;
pub mod config;
mod engine;
mod error;
pub mod flow;
pub mod iterator;
mod options;
mod server;
pub mod thread_pool;
