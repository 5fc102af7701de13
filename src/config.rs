//! Server configuration, shared credentials and the logging setup used by both executables.
use std::env;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::ArgMatches;
use serde_json::Value;
use tracing::{warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::{KvsError, Result};

/// the address a server listens on, and a client connects to, by default
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:4000";

/// the number of worker threads a server uses by default
pub const DEFAULT_THREADS: u32 = 4;

// the name of the file that records which engine a data directory belongs to
const ENGINE_FILE: &str = "engine";

/// A user name and password pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// the user name
    pub username: String,
    /// the password
    pub password: String,
}

impl Credentials {
    /// builder method to construct new `Credentials`
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credentials taken from the `USER` and `PASS` environment variables, falling back to
    /// `admin` and `test`. Explicit values win over the environment.
    pub fn from_env(username: Option<&str>, password: Option<&str>) -> Self {
        let username = username
            .map(String::from)
            .or_else(|| env::var("USER").ok())
            .unwrap_or_else(|| "admin".to_owned());
        let password = password
            .map(String::from)
            .or_else(|| env::var("PASS").ok())
            .unwrap_or_else(|| "test".to_owned());
        Credentials { username, password }
    }

    /// `true` if the given pair matches these credentials
    pub fn accepts(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}

/// The storage engines a server can run on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EngineKind {
    /// the log-structured [`KvStore`](crate::KvStore)
    Kvs,
    /// the [`SledKvsEngine`](crate::SledKvsEngine)
    Sled,
}

impl FromStr for EngineKind {
    type Err = KvsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "kvs" => Ok(EngineKind::Kvs),
            "sled" => Ok(EngineKind::Sled),
            other => Err(KvsError::Parsing(format!(
                "unknown engine {:?}, expected 'kvs' or 'sled'",
                other
            ))),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Kvs => write!(f, "kvs"),
            EngineKind::Sled => write!(f, "sled"),
        }
    }
}

/// Validated settings of a [`KvsServer`](crate::KvsServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// the address to listen on
    pub addr: SocketAddr,
    /// the storage engine to run
    pub engine: EngineKind,
    /// the data directory of the engine
    pub dir: PathBuf,
    /// the number of worker threads
    pub threads: u32,
    /// when set, every request but `Login` requires a successful login first
    pub credentials: Option<Credentials>,
    /// the document served by `Meta` requests
    pub meta: Value,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], 4000)),
            engine: EngineKind::Kvs,
            dir: PathBuf::from("."),
            threads: DEFAULT_THREADS,
            credentials: None,
            meta: Value::Object(Default::default()),
        }
    }
}

impl ServerConfig {
    /// Builds a config from the matches of the `kvs-server` command line.
    ///
    /// # Errors
    /// returns [`KvsError::Parsing`] if the address, engine, thread count or meta document is
    /// invalid
    pub fn from_matches(matches: &ArgMatches) -> Result<ServerConfig> {
        let addr = parse_addr(matches.value_of("addr").unwrap_or(DEFAULT_ADDRESS))?;
        let engine = matches.value_of("engine").unwrap_or("kvs").parse()?;
        let dir = match matches.value_of("dir") {
            Some(dir) => PathBuf::from(dir),
            None => env::current_dir()?,
        };
        let threads = match matches.value_of("threads") {
            Some(n) => n
                .parse::<u32>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or_else(|| KvsError::Parsing(format!("invalid thread count: {}", n)))?,
            None => DEFAULT_THREADS,
        };
        let meta = match matches.value_of("meta") {
            Some(json) => serde_json::from_str(json)
                .map_err(|e| KvsError::Parsing(format!("meta is not valid JSON: {}", e)))?,
            None => Value::Object(Default::default()),
        };
        let credentials = Credentials::from_env(
            matches.value_of("username"),
            matches.value_of("password"),
        );

        Ok(ServerConfig {
            addr,
            engine,
            dir,
            threads,
            credentials: Some(credentials),
            meta,
        })
    }

    /// Checks the requested engine against the one recorded in the data directory, then
    /// records it.
    ///
    /// # Errors
    /// returns [`KvsError::Parsing`] if the directory already belongs to another engine
    pub fn claim_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        match current_engine(&self.dir)? {
            Some(current) if current != self.engine => {
                return Err(KvsError::Parsing(format!(
                    "the requested engine: {} does not match the engine currently in use: {}",
                    self.engine, current
                )))
            }
            _ => {}
        }
        fs::write(self.dir.join(ENGINE_FILE), self.engine.to_string())?;
        Ok(())
    }
}

/// parses an `IP:PORT` pair
pub fn parse_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse().map_err(|_| {
        KvsError::Parsing(format!("could not parse {} into an IP address and port", addr))
    })
}

/// returns the engine recorded in `dir`, `None` if there is none (or it is unreadable)
fn current_engine(dir: &Path) -> Result<Option<EngineKind>> {
    let file = dir.join(ENGINE_FILE);
    if !file.exists() {
        return Ok(None);
    }
    match fs::read_to_string(file)?.parse() {
        Ok(engine) => Ok(Some(engine)),
        Err(e) => {
            warn!("The content of the engine file is invalid: {}", e);
            Ok(None)
        }
    }
}

/// Installs a global tracing subscriber that logs to STDERR, up to `level`.
///
/// # Errors
/// returns [`KvsError::Parsing`] for an unknown level, or [`KvsError::StringErr`] if a global
/// subscriber was already installed
pub fn init_logging(level: &str) -> Result<()> {
    let level = Level::from_str(level)
        .map_err(|_| KvsError::Parsing(format!("unknown log level: {}", level)))?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        // stdout is reserved for command output
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| KvsError::StringErr(format!("setting tracing default subscriber failed: {}", e)))
}
