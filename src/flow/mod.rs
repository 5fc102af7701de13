//! Flow-control primitives that turn push-style record delivery into pull-style consumption.
//!
//! - [`cell`]: a settle-once handoff between one producer and one consumer
//! - [`queue`]: an ordered sequence of cells; the Nth read always pairs with the Nth write
//! - [`duplex`]: a writable face and a readable face sharing one queue
//! - [`promised`]: a lazy sequence over a deferred collection
//! - [`pipe`]: the [`Source`]/[`Sink`] contract, and the pump that honors saturation
//!
//! Everything here is callback driven. Waiting is expressed as a continuation registered on a
//! cell; nothing blocks a thread except the explicit [`Awaiter::wait`] and [`Drain`].
pub mod cell;
pub mod duplex;
pub mod pipe;
pub mod promised;
pub mod queue;

pub use self::cell::{cell, Awaiter, Settler};
pub use self::duplex::{duplex, Chunk, DuplexReader, DuplexWriter};
pub use self::pipe::{pipe, Drain, Flow, Pipe, Sink, Source};
pub use self::promised::Promised;
pub use self::queue::{queue, Consumer, Producer};
