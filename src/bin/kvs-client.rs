//! The kvs-client executable supports the following command line arguments:
//!
//! `kvs-client [--addr IP-PORT] [--username USER] [--password PASS] <COMMAND>`
//!
//!     get <KEY>            print the value of KEY, or "Key not found"
//!     put <KEY> <VALUE>    set KEY to VALUE
//!     del <KEY>            remove KEY; a missing key is an error
//!     range [--gte K] [--lte K] [--limit N] [--reverse] [--keys-only | --values-only]
//!                          print the records of a range, one per line
//!     size <FROM> <TO>     print the approximate size of a key range
//!     meta                 print the server's metadata document
//!
//!     --addr defaults to 127.0.0.1:4000. USER and PASS default to the USER and PASS
//!     environment variables, then to admin / test.
//!     Print an error and return a non-zero exit code on server error, or if IP-PORT does not
//!     parse as an address.

use std::process::exit;

use clap::{crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};
use kvstream::config::{self, DEFAULT_ADDRESS};
use kvstream::{Credentials, KvsClient, KvsError, RangeOptions, Result};

fn main() {
    let matches = App::new("kvs-client")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("talks to a kvs-server")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommands(vec![
            SubCommand::with_name("get")
                .about("Get the string value of a given string key")
                .arg(Arg::with_name("KEY").required(true).index(1)),
            SubCommand::with_name("put")
                .about("Set the value of a string key to a string")
                .arg(Arg::with_name("KEY").required(true).index(1))
                .arg(Arg::with_name("VALUE").required(true).index(2)),
            SubCommand::with_name("del")
                .about("Removes a given key")
                .arg(Arg::with_name("KEY").required(true).index(1)),
            SubCommand::with_name("range")
                .about("Prints the records within a range of keys")
                .arg(Arg::with_name("gte").long("gte").takes_value(true))
                .arg(Arg::with_name("lte").long("lte").takes_value(true))
                .arg(Arg::with_name("limit").long("limit").takes_value(true))
                .arg(Arg::with_name("reverse").long("reverse"))
                .arg(Arg::with_name("keys-only").long("keys-only").conflicts_with("values-only"))
                .arg(Arg::with_name("values-only").long("values-only")),
            SubCommand::with_name("size")
                .about("Prints the approximate size of a range of keys")
                .arg(Arg::with_name("FROM").required(true).index(1))
                .arg(Arg::with_name("TO").required(true).index(2)),
            SubCommand::with_name("meta").about("Prints the server's metadata"),
        ])
        .arg(Arg::with_name("addr")
            .long("addr")
            .value_name("IP_ADDR:PORT")
            .help("sets the IP_ADDR:PORT of the server to connect to")
            .default_value(DEFAULT_ADDRESS)
            .global(true))
        .arg(Arg::with_name("username")
            .long("username")
            .value_name("USER")
            .global(true))
        .arg(Arg::with_name("password")
            .long("password")
            .value_name("PASS")
            .global(true))
        .get_matches();

    if let Err(e) = run(&matches) {
        eprintln!("{}", e);
        exit(1);
    }
}

/// runs the requested subcommand against the server
fn run(matches: &ArgMatches) -> Result<()> {
    config::init_logging("warn")?;
    let addr = config::parse_addr(matches.value_of("addr").unwrap_or(DEFAULT_ADDRESS))?;
    let credentials = Credentials::from_env(
        matches.value_of("username"),
        matches.value_of("password"),
    );
    let mut client = KvsClient::connect(addr, Some(credentials))?;

    match matches.subcommand() {
        ("get", Some(args)) => match client.get(required(args, "KEY")?)? {
            Some(value) => println!("{}", value),
            None => println!("Key not found"),
        },
        ("put", Some(args)) => client.put(required(args, "KEY")?, required(args, "VALUE")?)?,
        ("del", Some(args)) => client.delete(required(args, "KEY")?)?,
        ("range", Some(args)) => print_range(&client, range_options(args)?)?,
        ("size", Some(args)) => {
            let size = client.approximate_size(required(args, "FROM")?, required(args, "TO")?)?;
            println!("{}", size);
        }
        ("meta", Some(_)) => println!("{}", client.meta()?),
        (other, _) => return Err(KvsError::Parsing(format!("unknown command: {}", other))),
    }
    Ok(())
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
    args.value_of(name)
        .ok_or_else(|| KvsError::Parsing(format!("missing argument {}", name)))
}

/// parses the options of the `range` subcommand into [`RangeOptions`]
fn range_options(args: &ArgMatches) -> Result<RangeOptions> {
    let limit = match args.value_of("limit") {
        Some(n) => Some(
            n.parse::<usize>()
                .map_err(|_| KvsError::Parsing(format!("invalid limit: {}", n)))?,
        ),
        None => None,
    };
    Ok(RangeOptions {
        gte: args.value_of("gte").map(String::from),
        lte: args.value_of("lte").map(String::from),
        limit,
        reverse: args.is_present("reverse"),
        keys: !args.is_present("values-only"),
        values: !args.is_present("keys-only"),
        ..RangeOptions::default()
    })
}

fn print_range(client: &KvsClient, opts: RangeOptions) -> Result<()> {
    for entry in client.iterator(opts)?.entries() {
        let entry = entry?;
        match (entry.key, entry.value) {
            (Some(key), Some(value)) => println!("{}\t{}", key, value),
            (Some(only), None) | (None, Some(only)) => println!("{}", only),
            (None, None) => {}
        }
    }
    Ok(())
}
