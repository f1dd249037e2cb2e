use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::LevelFilter;

use minitftp::client;
use minitftp::config::{ClientConfig, Operation, ServerConfig, DEFAULT_PORT};
use minitftp::server::Server;
use minitftp::session::DEFAULT_MAX_RETRIES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OperationArg {
    Getfile,
    Putfile,
}

/// Minimal TFTP client and server (RFC 1350, octet mode).
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Operating mode.
    #[arg(short, long, value_enum)]
    mode: ModeArg,

    /// Server port: the port to listen on (server) or to send the initial
    /// request to (client).
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Remote server address (client mode).
    #[arg(short, long)]
    remote: Option<Ipv4Addr>,

    /// Transfer operation (client mode).
    #[arg(short, long, value_enum)]
    operation: Option<OperationArg>,

    /// File to transfer: requested name and local path (client mode).
    #[arg(short, long)]
    filename: Option<String>,

    /// Consecutive timeouts tolerated before a session is abandoned.
    #[arg(short = 'M', long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Log state machine events and transitions.
    #[arg(short, long)]
    trace: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cli.trace { LevelFilter::Trace } else { LevelFilter::Info })
        .init();

    anyhow::ensure!(cli.port != 0, "invalid port number");
    anyhow::ensure!(cli.max_retries > 0, "max retries must be at least 1");

    // Cooperative shutdown: ctrl-c raises a flag that every loop observes
    // once per iteration. In-flight sends and receives are not preempted.
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("detected ctrl-c, exiting...");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    match cli.mode {
        ModeArg::Server => {
            let cfg = ServerConfig { port: cli.port, max_retries: cli.max_retries };
            Server::bind(&cfg)?.serve(&stop).await
        }
        ModeArg::Client => {
            let remote = cli.remote.context("client mode requires --remote")?;
            anyhow::ensure!(!remote.is_unspecified(), "invalid remote address");
            let operation = match cli.operation.context("client mode requires --operation")? {
                OperationArg::Getfile => Operation::GetFile,
                OperationArg::Putfile => Operation::PutFile,
            };
            let filename = cli.filename.context("client mode requires --filename")?;

            let cfg = ClientConfig {
                remote,
                port: cli.port,
                operation,
                filename,
                max_retries: cli.max_retries,
            };
            client::run(&cfg, &stop).await
        }
    }
}
