//! this binary starts the kvs server
//! to see the list of options, type: `kvs-server --help`
//!
//! `kvs-server [--addr IP-PORT] [--engine ENGINE-NAME] [--dir PATH] [--threads N]
//!  [--username USER] [--password PASS] [--meta JSON] [--log-level LEVEL]`
//!
//!     Starts the server in PATH (the current directory by default) and listens on IP-PORT
//!     (127.0.0.1:4000 by default). ENGINE-NAME is either "kvs" or "sled"; a directory that
//!     was created by one engine can not be opened with the other.
//!     Connections must log in as USER / PASS, which default to the USER and PASS environment
//!     variables, then to admin / test.

use std::process::exit;

use clap::{crate_version, App, Arg, ArgMatches};
use kvstream::config::{self, DEFAULT_ADDRESS};
use kvstream::{
    EngineKind, KvStore, KvsEngine, KvsServer, RayonThreadPool, Result, ServerConfig,
    SledKvsEngine, ThreadPool,
};
use tracing::info;

fn main() {
    let matches = App::new("kvs-server")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("serves a key-value store over TCP")
        .arg(Arg::with_name("addr")
            .long("addr")
            .value_name("IP_ADDR:PORT")
            .help("sets the IP_ADDR:PORT that the server listens on")
            .default_value(DEFAULT_ADDRESS))
        .arg(Arg::with_name("engine")
            .long("engine")
            .value_name("ENGINE_NAME")
            .help("sets the storage engine to use")
            .possible_values(&["kvs", "sled"])
            .default_value("kvs"))
        .arg(Arg::with_name("dir")
            .long("dir")
            .value_name("PATH")
            .help("the data directory, defaults to the current directory"))
        .arg(Arg::with_name("threads")
            .long("threads")
            .value_name("N")
            .help("the number of worker threads"))
        .arg(Arg::with_name("username")
            .long("username")
            .value_name("USER")
            .help("the user allowed to log in, defaults to $USER"))
        .arg(Arg::with_name("password")
            .long("password")
            .value_name("PASS")
            .help("the password of that user, defaults to $PASS"))
        .arg(Arg::with_name("meta")
            .long("meta")
            .value_name("JSON")
            .help("a JSON document served to clients that ask for metadata"))
        .arg(Arg::with_name("log-level")
            .long("log-level")
            .value_name("LEVEL")
            .help("trace, debug, info, warn or error")
            .default_value("info"))
        .get_matches();

    if let Err(e) = start(&matches) {
        eprintln!("{}", e);
        exit(1);
    }
}

fn start(matches: &ArgMatches) -> Result<()> {
    config::init_logging(matches.value_of("log-level").unwrap_or("info"))?;
    let config = ServerConfig::from_matches(matches)?;
    config.claim_dir()?;

    info!("kvs-server {}", env!("CARGO_PKG_VERSION"));
    info!("Storage engine: {}", config.engine);
    info!("Data directory: {}", config.dir.display());

    match config.engine {
        EngineKind::Kvs => run_with_engine(KvStore::open(&config.dir)?, config),
        EngineKind::Sled => {
            let db = sled::open(&config.dir)?;
            run_with_engine(SledKvsEngine::new(db), config)
        }
    }
}

fn run_with_engine<E: KvsEngine>(engine: E, config: ServerConfig) -> Result<()> {
    let pool = RayonThreadPool::new(config.threads)?;
    KvsServer::new(engine, pool, config).run()
}
