use serde::{Deserialize, Serialize};

use crate::options::RangeOptions;

/// A key/value pair as stored by an engine and streamed over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// the key
    pub key: String,
    /// the value
    pub value: String,
}

impl Record {
    /// builder method to construct a new `Record`
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Record {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A record after key/value projection: excluded fields are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Entry {
    /// the key, if keys were requested
    pub key: Option<String>,
    /// the value, if values were requested
    pub value: Option<String>,
}

/// One operation of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BatchOp {
    /// set a key/value
    Put {
        /// the key to set
        key: String,
        /// the value to set
        value: String,
    },
    /// remove a key, if present
    Del {
        /// the key to remove
        key: String,
    },
}

/// These are the request "commands" that can be made to a remote key/value store
#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    /// authenticate this connection
    Login {
        /// the user name
        username: String,
        /// the password
        password: String,
    },
    /// forget this connection's authentication
    Logout,
    /// fetch the server's metadata document
    Meta,
    /// get a value from the store
    Get {
        /// the key to search for
        key: String,
    },
    /// set a key/value in the store
    Put {
        /// the key to set
        key: String,
        /// the value to set
        value: String,
    },
    /// remove a key/value from the store
    Delete {
        /// the key to remove
        key: String,
    },
    /// apply several operations at once
    Batch {
        /// the operations, applied in order
        ops: Vec<BatchOp>,
    },
    /// stream the records within a range
    Range {
        /// bounds, order and limit of the scan
        opts: RangeOptions,
    },
    /// estimate the bytes used by the keys in `from..=to`
    ApproximateSize {
        /// the first key of the range
        from: String,
        /// the last key of the range
        to: String,
    },
}

/// The response Types that can be returned for any Request
#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    /// this variant is returned when a request was successful
    Ok(Option<String>),
    /// the metadata document
    Meta(serde_json::Value),
    /// an approximate size in bytes
    Size(u64),
    /// one record of a range; more records or [`Response::End`] follow
    Record(Record),
    /// the last message of a range
    End,
    /// this variant is returned if an Error occurs while processing the request
    Err(String),
}
