use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Result, bail};
use clap::{Parser, builder::PossibleValuesParser};
use log::LevelFilter;
use once_cell::sync::OnceCell;
use tokio::runtime;

mod body;
mod client;
mod config;
mod context;
mod error;
mod http;
mod logger;
mod pool;
mod tcp;

use crate::{config::Config, logger::Logger};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(
        long,
        value_parser=PossibleValuesParser::new(["error", "warn", "info", "debug", "trace"]),
        default_value = "info",
        help = "Log level",
    )]
    pub(crate) log_level: String,
    #[arg(
        short,
        long,
        help = "Path to the configuration file, built-in defaults are used if not set"
    )]
    config: Option<PathBuf>,
    #[arg(long, help = "Address and port to listen on, overrides the configuration")]
    bind: Option<SocketAddr>,
    #[arg(long, help = "Number of workers, overrides the configuration")]
    threads: Option<usize>,
}

fn main() -> Result<()> {
    // Start by parsing the cli arguments.
    let args = Args::parse();

    // Set the log level.
    let log_level = match args.log_level.as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        x => bail!("Invalid log_level: {}", x),
    };
    Logger::init(log_level)?;

    // Parse the configuration file, if any, and apply the overrides.
    let mut config = match args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }

    // Serve until interrupted.
    tcp::Server::new(config)?.start()
}

static RUNTIME: OnceCell<runtime::Runtime> = OnceCell::new();

#[macro_export]
macro_rules! runtime {
    () => {
        $crate::RUNTIME.get_or_try_init(|| {
            ::tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
        })
    };
}
