use std::time::Duration;

use clap::Parser;
use datagen::{
    config::{self, Cli, Config},
    lifecycle,
};
use jemallocator::Jemalloc;
use tokio::{runtime::Builder, signal};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    #[error(transparent)]
    Lifecycle(#[from] lifecycle::Error),
}

async fn interrupted() {
    match signal::ctrl_c().await {
        Ok(()) => info!("received ctrl-c"),
        Err(err) => {
            // Without a handler the run can still end by duration.
            error!("unable to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    }
}

fn main() -> Result<(), Error> {
    // stdout carries payload bytes, keep logs off it.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting datagen {version} run.");

    let config = Config::try_from(Cli::parse()).map_err(|err| {
        error!("{err}");
        Error::Config(err)
    })?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(lifecycle::run(&config, interrupted()));
    // Bounds whatever is still parked on the runtime, blocking file
    // operations included.
    runtime.shutdown_timeout(lifecycle::SHUTDOWN_GRACE + Duration::from_secs(1));
    match res {
        Ok(_) => {
            info!("Bye. :)");
            Ok(())
        }
        Err(err) => {
            error!("{err}");
            Err(err.into())
        }
    }
}
