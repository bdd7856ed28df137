pub mod cli;
pub mod config;
pub mod console;
pub mod context;
pub mod db;
pub mod error;
pub mod export;
pub mod identity;
pub mod live;
pub mod registry;
pub mod session;
pub mod transport;
mod utils;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{
    io::{stdin, stdout, BufReader},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use cli::Args;
use config::AppConfig;
use console::Console;
use context::AppContext;
use identity::IdentityResolver;
use transport::TcpAcceptor;
use utils::log_buffer::BufferedLogger;

pub use utils::log_buffer::LogBuffer;

const LINK_QUEUE: usize = 16;

pub fn run() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var); recent lines also feed `logs`
    let logs = LogBuffer::default();
    let stderr_logger = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .build();
    BufferedLogger::new(stderr_logger, logs.clone())
        .install()
        .context("failed to install logger")?;

    let args = Args::parse();
    log::info!("watchlink starting up...");
    let config = AppConfig::resolve(&args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the tokio runtime")?;
    let result = runtime.block_on(serve(config, logs));
    // Stdin is read on a blocking thread that never returns on its own.
    runtime.shutdown_timeout(Duration::from_millis(250));
    result
}

async fn serve(config: AppConfig, logs: LogBuffer) -> Result<()> {
    let ctx = AppContext::open(config).await?.with_logs(logs);

    let acceptor = TcpAcceptor::bind(ctx.config.listen_addr.as_str()).await?;
    log::info!("listening for watches on {}", acceptor.local_addr()?);

    let (links_tx, links_rx) = mpsc::channel(LINK_QUEUE);
    let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
    let resolver = Arc::new(IdentityResolver::new(
        ctx.registry.clone(),
        ctx.config.identity_param.clone(),
        ctx.config.subscriber_buffer,
        fatal_tx,
    ));
    tokio::spawn(acceptor.run(links_tx, ctx.shutdown.clone()));
    tokio::spawn(resolver.run(links_rx, ctx.shutdown.clone()));
    tokio::spawn(cancel_on_interrupt(ctx.shutdown.clone()));

    let mut console = Console::new(&ctx, BufReader::new(stdin()), stdout());
    let outcome = tokio::select! {
        result = console.run() => result,
        Some(err) = fatal_rx.recv() => {
            Err(anyhow::Error::new(err).context("a new watch could not be stored; stopping"))
        }
    };

    ctx.shutdown.cancel();
    log::info!("watchlink shutting down");
    outcome
}

/// The only SIGINT handler in the process: Ctrl-C stops a running live
/// capture and then the console.
async fn cancel_on_interrupt(shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                log::info!("interrupted");
                shutdown.cancel();
            }
            Err(err) => log::warn!("cannot listen for Ctrl-C: {err}"),
        },
    }
}
