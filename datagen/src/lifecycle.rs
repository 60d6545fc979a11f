//! Orderly start and stop of one datagen run.
//!
//! [`run`] resolves the sink, starts the metrics server, drives the
//! [`Emitter`] and then tears everything down in order: the emitter stops
//! first, the metrics server is given [`SHUTDOWN_GRACE`] to finish in-flight
//! requests, and finally the sink is flushed, synced and closed.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{pin, time};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    emitter::{Emitter, Summary},
    httpd, signal,
    sink::{self, Sink},
    telemetry::Registry,
};

/// How long the metrics server may take to stop before it is aborted.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`run`].
pub enum Error {
    /// See [`crate::sink::Error`] for details.
    #[error(transparent)]
    Sink(#[from] sink::Error),
}

/// Run datagen to completion.
///
/// The run ends when `interrupt` resolves or the configured duration
/// elapses, whichever comes first. In both cases the tick in progress is
/// finished before stopping.
///
/// # Errors
///
/// Returns an error if the sink cannot be resolved. In that case no record
/// is produced.
pub async fn run<F>(config: &Config, interrupt: F) -> Result<Summary, Error>
where
    F: Future<Output = ()>,
{
    info!(
        bytes_per_second = config.bytes_per_second,
        payload_size = config.payload_size.get(),
        duration = ?config.duration,
        no_stdout = config.no_stdout,
        sink = %config.sink,
        metrics_addr = %config.metrics_addr,
        audit_every = config.audit_every.get(),
        "datagen starting"
    );

    let mut sink = Sink::resolve(&config.sink, config.no_stdout, config.audit_every).await?;

    let registry = Arc::new(Registry::new(config.global_labels.clone()));
    let (shutdown_watcher, shutdown_broadcast) = signal::signal();

    let metrics_server = match httpd::Server::bind(
        &config.metrics_addr,
        Arc::clone(&registry),
        shutdown_watcher.clone(),
    )
    .await
    {
        Ok(server) => Some(tokio::spawn(server.run())),
        Err(err) => {
            error!("metrics server unavailable, continuing without it: {err}");
            None
        }
    };

    let emitter = Emitter::new(config, Arc::clone(&registry), shutdown_watcher);
    let summary = {
        let emit = emitter.spin(&mut sink);
        pin!(emit);
        pin!(interrupt);

        let finished = tokio::select! {
            summary = &mut emit => Some(summary),
            () = &mut interrupt => None,
        };
        match finished {
            Some(summary) => summary,
            None => {
                info!("received interrupt, finishing current tick");
                shutdown_broadcast.signal();
                emit.await
            }
        }
    };

    shutdown_broadcast.signal();
    if let Some(mut handle) = metrics_server {
        match time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => debug!("metrics server shut down successfully"),
            Ok(Err(err)) => error!("could not join the metrics server task: {err}"),
            Err(_) => {
                warn!(
                    "metrics server did not stop within {}s, aborting",
                    SHUTDOWN_GRACE.as_secs()
                );
                handle.abort();
            }
        }
    }

    if let Err(err) = sink.close().await {
        warn!("failed to close sink cleanly: {err}");
    }

    info!(
        ticks = summary.ticks,
        records = summary.records,
        bytes = summary.bytes,
        "datagen finished"
    );
    Ok(summary)
}
