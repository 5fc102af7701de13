use std::io::{BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread::{self, JoinHandle};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::de::IoRead;
use serde_json::{Deserializer, Value};
use tracing::{debug, instrument, warn};

use crate::command::{BatchOp, Record, Request, Response};
use crate::config::Credentials;
use crate::flow::{duplex, DuplexReader, DuplexWriter, Source};
use crate::iterator::StreamIterator;
use crate::options::RangeOptions;
use crate::{KvsError, Result};

/// turns an error message sent by the server back into the matching [`KvsError`]
fn remote_error(msg: String) -> KvsError {
    if msg == KvsError::Unauthorized.to_string() {
        KvsError::Unauthorized
    } else if msg == KvsError::KeyNotFound.to_string() {
        KvsError::KeyNotFound
    } else {
        KvsError::StringErr(msg)
    }
}

fn unexpected(resp: Response) -> KvsError {
    KvsError::Protocol(format!("unexpected response: {:?}", resp))
}

/// One logged-in socket connection to a server.
struct Connection {
    reader: Deserializer<IoRead<BufReader<TcpStream>>>,
    writer: BufWriter<TcpStream>,
}

impl Connection {
    fn open(addr: SocketAddr, credentials: Option<&Credentials>) -> Result<Connection> {
        let tcp_reader = TcpStream::connect(addr)?;
        let tcp_writer = tcp_reader.try_clone()?;
        let mut conn = Connection {
            reader: Deserializer::from_reader(BufReader::new(tcp_reader)),
            writer: BufWriter::new(tcp_writer),
        };
        if let Some(creds) = credentials {
            conn.call(&Request::Login {
                username: creds.username.clone(),
                password: creds.password.clone(),
            })?;
        }
        Ok(conn)
    }

    fn send(&mut self, req: &Request) -> Result<()> {
        serde_json::to_writer(&mut self.writer, req)?;
        self.writer.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Response> {
        Ok(Response::deserialize(&mut self.reader)?)
    }

    /// sends `req` and reads its single response, re-throwing a server error
    fn call(&mut self, req: &Request) -> Result<Response> {
        self.send(req)?;
        match self.receive()? {
            Response::Err(msg) => Err(remote_error(msg)),
            resp => Ok(resp),
        }
    }
}

/// `KvsClient` contains the functionality for communication with a [`KvsServer`](crate::KvsServer)
///
/// Plain requests share one connection. Every [`read_stream`](KvsClient::read_stream) and
/// [`write_stream`](KvsClient::write_stream) opens a connection of its own, serviced by a
/// dedicated transport thread.
pub struct KvsClient {
    addr: SocketAddr,
    credentials: Option<Credentials>,
    conn: Connection,
}

impl KvsClient {
    /// creates a client and establishes a socket connection to the server at the given `addr`,
    /// logging in with `credentials` if given
    pub fn connect<A: ToSocketAddrs>(addr: A, credentials: Option<Credentials>) -> Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| KvsError::Parsing("address resolved to nothing".to_owned()))?;
        let conn = Connection::open(addr, credentials.as_ref())?;
        Ok(KvsClient {
            addr,
            credentials,
            conn,
        })
    }

    /// gets the value of the specified `key` from the server
    /// ## Returns
    /// `Ok<Some<String>>` if the value was found for the key.
    /// `Ok<None>` if there is no value associated with the key
    pub fn get(&mut self, key: impl Into<String>) -> Result<Option<String>> {
        match self.conn.call(&Request::Get { key: key.into() })? {
            Response::Ok(value) => Ok(value),
            resp => Err(unexpected(resp)),
        }
    }

    /// gets the value of `key` and decodes it from JSON
    pub fn get_json<T: DeserializeOwned>(&mut self, key: impl Into<String>) -> Result<Option<T>> {
        match self.get(key)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// sends a put key/value request to the server
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let req = Request::Put {
            key: key.into(),
            value: value.into(),
        };
        self.conn.call(&req).map(drop)
    }

    /// encodes `value` as JSON and puts it under `key`
    pub fn put_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let value = serde_json::to_string(value)?;
        self.put(key, value)
    }

    /// removes a key and its associated value from the store
    /// # Errors
    /// [`KvsError::KeyNotFound`] if the key does not exist
    pub fn delete(&mut self, key: impl Into<String>) -> Result<()> {
        self.conn.call(&Request::Delete { key: key.into() }).map(drop)
    }

    /// applies `ops` in order on the server
    pub fn batch(&mut self, ops: Vec<BatchOp>) -> Result<()> {
        self.conn.call(&Request::Batch { ops }).map(drop)
    }

    /// estimates the bytes used by the keys in `from..=to`
    pub fn approximate_size(&mut self, from: impl Into<String>, to: impl Into<String>) -> Result<u64> {
        let req = Request::ApproximateSize {
            from: from.into(),
            to: to.into(),
        };
        match self.conn.call(&req)? {
            Response::Size(size) => Ok(size),
            resp => Err(unexpected(resp)),
        }
    }

    /// fetches the server's metadata document
    pub fn meta(&mut self) -> Result<Value> {
        match self.conn.call(&Request::Meta)? {
            Response::Meta(meta) => Ok(meta),
            resp => Err(unexpected(resp)),
        }
    }

    /// ends this connection's login
    pub fn logout(&mut self) -> Result<()> {
        self.conn.call(&Request::Logout).map(drop)
    }

    /// Streams the records of a range.
    ///
    /// The records are decoded on a transport thread and written into the returned reader as
    /// they arrive. Closing (or dropping) the reader makes the transport hang up at the next
    /// record. Whole records are delivered whatever the `keys`/`values` flags say; use
    /// [`key_stream`](KvsClient::key_stream) or [`value_stream`](KvsClient::value_stream)
    /// for one side only.
    pub fn read_stream(&self, opts: RangeOptions) -> Result<DuplexReader<Record>> {
        self.open_stream(opts, |record| record)
    }

    /// Streams only the keys of a range.
    pub fn key_stream(&self, opts: RangeOptions) -> Result<DuplexReader<String>> {
        self.open_stream(opts, |record| record.key)
    }

    /// Streams only the values of a range.
    pub fn value_stream(&self, opts: RangeOptions) -> Result<DuplexReader<String>> {
        self.open_stream(opts, |record| record.value)
    }

    fn open_stream<T: Send + 'static>(
        &self,
        opts: RangeOptions,
        project: fn(Record) -> T,
    ) -> Result<DuplexReader<T>> {
        let mut conn = Connection::open(self.addr, self.credentials.as_ref())?;
        conn.send(&Request::Range { opts })?;

        let (writer, reader) = duplex();
        thread::Builder::new()
            .name("kvs-range-transport".to_owned())
            .spawn(move || forward_records(conn, writer, project))?;
        Ok(reader)
    }

    /// Opens a [`StreamIterator`] over a remote range.
    pub fn iterator(&self, opts: RangeOptions) -> Result<StreamIterator> {
        StreamIterator::open(opts, |transport| self.read_stream(transport.clone()))
    }

    /// Opens a stream that stores every record written into it with a `Put` request.
    pub fn write_stream(&self) -> Result<RecordWriter> {
        let mut conn = Connection::open(self.addr, self.credentials.as_ref())?;
        let (writer, reader) = duplex::<Record>();
        let handle = thread::Builder::new()
            .name("kvs-write-transport".to_owned())
            .spawn(move || -> Result<u64> {
                let mut stored = 0;
                for record in reader.drain() {
                    let Record { key, value } = record?;
                    conn.call(&Request::Put { key, value })?;
                    stored += 1;
                }
                Ok(stored)
            })?;
        Ok(RecordWriter {
            writer,
            handle: Some(handle),
        })
    }
}

/// copies the responses of a range request into `writer` until `End`, an error, or until the
/// reading side goes away
#[instrument(skip(conn, writer, project))]
fn forward_records<T: Send + 'static>(
    mut conn: Connection,
    mut writer: DuplexWriter<T>,
    project: fn(Record) -> T,
) {
    let mut received = 0_u64;
    loop {
        match conn.receive() {
            Ok(Response::Record(record)) => {
                received += 1;
                if writer.write(project(record)).is_err() {
                    debug!(received, "range reader closed, hanging up");
                    return;
                }
            }
            Ok(Response::End) => {
                debug!(received, "range complete");
                writer.end();
                return;
            }
            Ok(Response::Err(msg)) => {
                writer.abort(remote_error(msg));
                return;
            }
            Ok(resp) => {
                writer.abort(unexpected(resp));
                return;
            }
            Err(e) => {
                warn!("range transport failed: {}", e);
                writer.abort(e);
                return;
            }
        }
    }
}

/// The writable end of [`KvsClient::write_stream`].
pub struct RecordWriter {
    writer: DuplexWriter<Record>,
    handle: Option<JoinHandle<Result<u64>>>,
}

impl RecordWriter {
    /// queues `record` for storage. Fails with [`KvsError::Closed`] once a put has failed.
    pub fn write(&mut self, record: Record) -> Result<()> {
        self.writer.write(record)
    }

    /// Ends the stream and waits until every queued record is stored.
    ///
    /// Returns the number of records stored, or the first error.
    pub fn finish(mut self) -> Result<u64> {
        self.writer.end();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| KvsError::StringErr("write stream transport panicked".to_owned()))?,
            None => Ok(0),
        }
    }
}

impl Drop for RecordWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.writer.abort(KvsError::Closed);
        }
    }
}
