use std::io::{BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use serde_json::Deserializer;
use tracing::{debug, error, info, instrument, warn};

use crate::command::{Request, Response};
use crate::config::ServerConfig;
use crate::flow::{Awaiter, Promised, Source};
use crate::options::RangeOptions;
use crate::thread_pool::ThreadPool;
use crate::{KvsEngine, KvsError, Result};

/// A TCP socket server implementation over a key value storage engine.
/// It listens for incoming connections on the configured address and services each connection
/// on a thread of its [`ThreadPool`].
///
/// Each connection receives a handle to the [`KvsEngine`], and uses that engine to process its
/// requests one after another. When the [`ServerConfig`] carries credentials, a connection must
/// send a successful `Login` before anything else is answered.
///
/// # Example
/// ```rust,no_run
/// use kvstream::{KvStore, KvsServer, ServerConfig};
/// use kvstream::thread_pool::{RayonThreadPool, ThreadPool};
/// # fn main() -> kvstream::Result<()> {
/// let config = ServerConfig::default();
/// let pool = RayonThreadPool::new(config.threads)?;
/// let engine = KvStore::open(&config.dir)?;
/// KvsServer::new(engine, pool, config).run()?;
/// # Ok(())
/// # }
/// ```
pub struct KvsServer<E: KvsEngine, P: ThreadPool> {
    /// the kvs engine to use
    engine: E,
    /// a pool of threads that will service connections using a handle to the engine
    pool: P,
    config: Arc<ServerConfig>,
}

impl<E: KvsEngine, P: ThreadPool> KvsServer<E, P> {
    /// Create a new `KvsServer` using the given [`KvsEngine`] and [`ThreadPool`] implementation.
    pub fn new(engine: E, pool: P, config: ServerConfig) -> Self {
        KvsServer {
            engine,
            pool,
            config: Arc::new(config),
        }
    }

    /// starts a server listening on the configured address.
    ///
    /// # Errors
    /// returns [`KvsError`] if the server could not bind its address
    pub fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.addr)?;
        self.serve_on(listener)
    }

    /// serves connections accepted by an already bound `listener`. Never returns unless
    /// accepting fails for good.
    pub fn serve_on(self, listener: TcpListener) -> Result<()> {
        info!("listening on {}", listener.local_addr()?);
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let engine = self.engine.clone();
                    let config = Arc::clone(&self.config);
                    self.pool.spawn(move || {
                        if let Err(e) = serve(engine, config, stream) {
                            error!("Error on serving client: {}", e);
                        }
                    });
                }
                Err(e) => error!("Connection failed: {}", e),
            }
        }
        Ok(())
    }
}

/// The per-connection state.
struct Session<'a, E> {
    engine: E,
    config: &'a ServerConfig,
    peer: SocketAddr,
    logged_in: bool,
}

/// Processes the requests coming over the given `tcp` stream until the client hangs up.
#[instrument(skip(engine, config))]
fn serve<E: KvsEngine>(engine: E, config: Arc<ServerConfig>, tcp: TcpStream) -> Result<()> {
    let peer = tcp.peer_addr()?;
    let requests = Deserializer::from_reader(BufReader::new(&tcp)).into_iter::<Request>();
    let mut writer = BufWriter::new(&tcp);
    let mut session = Session {
        engine,
        config: &config,
        peer,
        logged_in: config.credentials.is_none(),
    };

    for req in requests {
        let req = req?;
        debug!("Receive request from {}: {:?}", peer, req);
        session.handle(req, &mut writer)?;
        writer.flush()?;
    }
    debug!("{} disconnected", peer);
    Ok(())
}

fn send<W: Write>(writer: &mut W, resp: &Response) -> Result<()> {
    serde_json::to_writer(writer, resp)?;
    Ok(())
}

fn reply<T, W: Write>(writer: &mut W, result: Result<T>, ok: impl FnOnce(T) -> Response) -> Result<()> {
    let resp = match result {
        Ok(value) => ok(value),
        Err(e) => Response::Err(e.to_string()),
    };
    send(writer, &resp)
}

impl<E: KvsEngine> Session<'_, E> {
    fn handle<W: Write>(&mut self, req: Request, writer: &mut W) -> Result<()> {
        match req {
            Request::Login { username, password } => {
                let result = self.login(&username, &password);
                reply(writer, result, |_| Response::Ok(None))
            }
            Request::Logout => {
                self.logged_in = self.config.credentials.is_none();
                send(writer, &Response::Ok(None))
            }
            _ if !self.logged_in => {
                warn!("rejected request from {}: not logged in", self.peer);
                send(writer, &Response::Err(KvsError::Unauthorized.to_string()))
            }
            Request::Meta => send(writer, &Response::Meta(self.config.meta.clone())),
            Request::Get { key } => reply(writer, self.engine.get(key), Response::Ok),
            Request::Put { key, value } => {
                reply(writer, self.engine.put(key, value), |_| Response::Ok(None))
            }
            Request::Delete { key } => {
                reply(writer, self.engine.delete(key), |_| Response::Ok(None))
            }
            Request::Batch { ops } => reply(writer, self.engine.batch(ops), |_| Response::Ok(None)),
            Request::ApproximateSize { from, to } => {
                reply(writer, self.engine.approximate_size(&from, &to), Response::Size)
            }
            Request::Range { opts } => self.stream_range(opts, writer),
        }
    }

    fn login(&mut self, username: &str, password: &str) -> Result<()> {
        match &self.config.credentials {
            Some(creds) if !creds.accepts(username, password) => {
                self.logged_in = false;
                warn!("failed login for {:?} from {}", username, self.peer);
                Err(KvsError::Unauthorized)
            }
            _ => {
                self.logged_in = true;
                info!("{:?} logged in from {}", username, self.peer);
                Ok(())
            }
        }
    }

    /// Writes every record of the range, then `End`. A failed scan is answered with a single
    /// `Err` in place of `End`.
    fn stream_range<W: Write>(&self, opts: RangeOptions, writer: &mut W) -> Result<()> {
        let opts = opts.normalized();
        let engine = self.engine.clone();
        let records = Promised::new(move || Awaiter::ready(engine.range(&opts)));

        let mut sent = 0_u64;
        for record in records.drain() {
            match record {
                Ok(record) => {
                    send(writer, &Response::Record(record))?;
                    sent += 1;
                }
                Err(e) => return send(writer, &Response::Err(e.to_string())),
            }
        }
        debug!(sent, "range streamed to {}", self.peer);
        send(writer, &Response::End)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::KvStore;
    use tempfile::TempDir;

    fn responses(out: &[u8]) -> Vec<Response> {
        Deserializer::from_slice(out)
            .into_iter::<Response>()
            .collect::<serde_json::Result<_>>()
            .unwrap()
    }

    fn get(key: &str) -> Request {
        Request::Get {
            key: key.to_owned(),
        }
    }

    #[test]
    fn requests_wait_for_a_login_and_logout_locks_again() {
        let dir = TempDir::new().unwrap();
        let engine = KvStore::open(dir.path()).unwrap();
        engine.put("k".to_owned(), "v".to_owned()).unwrap();
        let config = ServerConfig {
            credentials: Some(Credentials::new("user", "secret")),
            ..ServerConfig::default()
        };
        let mut session = Session {
            engine,
            config: &config,
            peer: SocketAddr::from(([127, 0, 0, 1], 0)),
            logged_in: false,
        };

        let mut out = Vec::new();
        session.handle(get("k"), &mut out).unwrap();
        let login = |password: &str| Request::Login {
            username: "user".to_owned(),
            password: password.to_owned(),
        };
        session.handle(login("wrong"), &mut out).unwrap();
        session.handle(login("secret"), &mut out).unwrap();
        session.handle(get("k"), &mut out).unwrap();
        session.handle(Request::Logout, &mut out).unwrap();
        session.handle(Request::Meta, &mut out).unwrap();

        let resps = responses(&out);
        assert_eq!(resps.len(), 6);
        assert!(matches!(&resps[0], Response::Err(msg) if msg == "unauthorized"));
        assert!(matches!(&resps[1], Response::Err(msg) if msg == "unauthorized"));
        assert!(matches!(&resps[2], Response::Ok(None)));
        assert!(matches!(&resps[3], Response::Ok(Some(v)) if v == "v"));
        assert!(matches!(&resps[4], Response::Ok(None)));
        assert!(matches!(&resps[5], Response::Err(msg) if msg == "unauthorized"));
    }
}
