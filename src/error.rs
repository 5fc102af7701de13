use thiserror::Error;

/// type alias for all operations in this crate that could fail with a [`KvsError`]
pub type Result<T> = std::result::Result<T, KvsError>;

/// The Error variants used by the stores, the network layer and the flow-control core.
///
/// Lower level errors from third party crates are wrapped with `#[from]` so they can be
/// propagated with `?`.
#[derive(Error, Debug)]
pub enum KvsError {
    /// variant for errors caused from file or socket IO
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// variant for JSON (de)serialization errors
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// variant for errors raised by the sled engine
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// variant for errors when a key was not found in the store
    #[error("Key not found")]
    KeyNotFound,

    /// an error message received from a remote server, or raised while servicing a request
    #[error("{0}")]
    StringErr(String),

    /// a command line option or stored value could not be parsed
    #[error("parsing error: {0}")]
    Parsing(String),

    /// an invalid command was found in a command log
    #[error("invalid command: {0}")]
    Command(String),

    /// the peer sent a message that is not valid at this point of the conversation
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// the connection has not logged in, or the credentials were rejected
    #[error("unauthorized")]
    Unauthorized,

    /// the stream or queue was closed before a value was delivered
    #[error("stream closed")]
    Closed,

    /// `next` was called on an iterator after `end`
    #[error("iterator has already ended")]
    IteratorClosed,
}
