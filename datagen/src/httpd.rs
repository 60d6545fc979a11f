//! The metrics HTTP server.
//!
//! Serves the [`Registry`] in the Prometheus text format at `/metrics` and a
//! liveness probe answering `ok` at `/health`. The server runs beside the
//! emission loop for the whole run; nothing it does, including failing to
//! resolve or bind its address, stops emission.

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderValue},
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::{conn::auto, graceful::GracefulShutdown},
};
use tokio::{
    net::{self, TcpListener},
    pin,
    sync::{Semaphore, TryAcquireError},
};
use tracing::{debug, error, info, warn};

use crate::{signal::Watcher, telemetry::Registry};

const CONCURRENT_CONNECTIONS_MAX: usize = 100;
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";
const TEXT_CONTENT_TYPE: &str = "text/plain";

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Server`].
pub enum Error {
    /// The listen address could not be resolved.
    #[error("invalid metrics address '{addr}': {source}")]
    Resolve {
        /// Listen address as given.
        addr: String,
        /// Underlying resolution failure.
        source: io::Error,
    },
    /// The listen address resolved to nothing.
    #[error("metrics address '{0}' resolved to no socket address")]
    Unresolved(String),
    /// None of the resolved addresses could be bound.
    #[error("failed to bind metrics server to {addr}: {source}")]
    Bind {
        /// Listen address as given.
        addr: String,
        /// Error from the last address tried.
        source: io::Error,
    },
}

/// Resolve a listen address into the socket addresses to try, in order.
///
/// A bare `:PORT` means every interface: the IPv6 wildcard first, the IPv4
/// wildcard second for hosts without IPv6.
///
/// # Errors
///
/// Returns an error if `addr` does not resolve.
pub async fn resolve(addr: &str) -> Result<Vec<SocketAddr>, Error> {
    let mut resolved = Vec::new();
    if let Some(port) = addr.strip_prefix(':') {
        let port: u16 = port.parse().map_err(|_| Error::Resolve {
            addr: addr.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "invalid port"),
        })?;
        resolved.push(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)));
        resolved.push(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    } else {
        let addrs = net::lookup_host(addr)
            .await
            .map_err(|source| Error::Resolve {
                addr: addr.to_string(),
                source,
            })?;
        resolved.extend(addrs);
    }

    if resolved.is_empty() {
        return Err(Error::Unresolved(addr.to_string()));
    }
    Ok(resolved)
}

fn full(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn route(req: &Request<Incoming>, registry: &Registry) -> Response<BoxBody<Bytes, hyper::Error>> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return respond(
            StatusCode::METHOD_NOT_ALLOWED,
            TEXT_CONTENT_TYPE,
            "method not allowed\n",
        );
    }
    match req.uri().path() {
        "/metrics" => respond(StatusCode::OK, PROMETHEUS_CONTENT_TYPE, registry.render()),
        "/health" => respond(StatusCode::OK, TEXT_CONTENT_TYPE, "ok"),
        _ => respond(StatusCode::NOT_FOUND, TEXT_CONTENT_TYPE, "not found\n"),
    }
}

#[derive(Debug)]
/// The metrics server.
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    shutdown: Watcher,
}

impl Server {
    /// Bind a new [`Server`] to `addr`, see [`resolve`] for the accepted
    /// forms.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not resolve or cannot be bound,
    /// for instance because the port is in use.
    pub async fn bind(
        addr: &str,
        registry: Arc<Registry>,
        shutdown: Watcher,
    ) -> Result<Self, Error> {
        let candidates = resolve(addr).await?;
        let listener = TcpListener::bind(candidates.as_slice())
            .await
            .map_err(|source| Error::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            registry,
            shutdown,
        })
    }

    /// The address actually bound, useful when binding port 0.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run [`Server`] until the shutdown signal is received.
    ///
    /// After the signal no new connections are accepted, idle connections are
    /// closed and requests in flight are answered. Returns once every
    /// connection is gone; callers that cannot wait that long must bound it
    /// themselves.
    pub async fn run(self) {
        let Self {
            listener,
            registry,
            shutdown,
        } = self;
        if let Ok(addr) = listener.local_addr() {
            info!("metrics server listening on {addr}");
        }

        let connections = Arc::new(Semaphore::new(CONCURRENT_CONNECTIONS_MAX));
        let builder = auto::Builder::new(TokioExecutor::new());
        let graceful = GracefulShutdown::new();

        let shutdown_wait = shutdown.recv();
        pin!(shutdown_wait);
        loop {
            let (stream, peer) = tokio::select! {
                () = &mut shutdown_wait => break,
                incoming = listener.accept() => match incoming {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("metrics server failed to accept: {err}");
                        continue;
                    }
                },
            };

            let permit = match Arc::clone(&connections).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    warn!(
                        "metrics server at {CONCURRENT_CONNECTIONS_MAX} connections, dropping {peer}"
                    );
                    continue;
                }
                Err(TryAcquireError::Closed) => {
                    error!("metrics server connection limit closed");
                    break;
                }
            };
            debug!("metrics scrape connection from {peer}");

            let registry = Arc::clone(&registry);
            let service = hyper::service::service_fn(move |req| {
                let response = route(&req, &registry);
                async move { Ok::<_, hyper::Error>(response) }
            });
            let connection = graceful.watch(
                builder
                    .serve_connection(TokioIo::new(stream), service)
                    .into_owned(),
            );
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    debug!("metrics connection from {peer} ended with error: {err}");
                }
                drop(permit);
            });
        }

        drop(listener);
        info!("metrics server closing connections");
        graceful.shutdown().await;
        debug!("metrics server stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rustc_hash::FxHashMap;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;
    use crate::signal;

    async fn get(addr: SocketAddr, path: &str) -> String {
        request(addr, "GET", path).await
    }

    async fn request(addr: SocketAddr, method: &str, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(
                format!("{method} {path} HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .expect("write request");
        let mut out = String::new();
        stream.read_to_string(&mut out).await.expect("read response");
        out
    }

    async fn start(registry: Arc<Registry>) -> (SocketAddr, signal::Broadcaster, tokio::task::JoinHandle<()>) {
        let (watcher, broadcaster) = signal::signal();
        let server = Server::bind("127.0.0.1:0", registry, watcher)
            .await
            .expect("bind");
        let addr = server.local_addr().expect("local addr");
        (addr, broadcaster, tokio::spawn(server.run()))
    }

    #[tokio::test]
    async fn serves_health_and_metrics() {
        let registry = Arc::new(Registry::new(FxHashMap::default()));
        registry.produced(3000, 6);
        let (addr, broadcaster, handle) = start(Arc::clone(&registry)).await;

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200 OK"), "{health}");
        assert!(health.ends_with("\r\n\r\nok"), "{health}");

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200 OK"), "{metrics}");
        assert!(metrics.contains("generator_bytes_produced_total 3000"));
        assert!(metrics.contains("generator_records_produced_total 6"));

        let missing = get(addr, "/nope").await;
        assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");

        let post = request(addr, "POST", "/metrics").await;
        assert!(post.starts_with("HTTP/1.1 405"), "{post}");

        broadcaster.signal();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .expect("server task panicked");
    }

    #[tokio::test]
    async fn occupied_port_fails_to_bind() {
        let registry = Arc::new(Registry::new(FxHashMap::default()));
        let (addr, _broadcaster, _handle) = start(Arc::clone(&registry)).await;

        let (watcher, _b) = signal::signal();
        let err = Server::bind(&addr.to_string(), registry, watcher)
            .await
            .expect_err("port is taken");
        assert!(matches!(err, Error::Bind { .. }));
    }

    #[tokio::test]
    async fn idle_keep_alive_connection_does_not_hold_shutdown() {
        let registry = Arc::new(Registry::new(FxHashMap::default()));
        let (addr, broadcaster, handle) = start(registry).await;

        let mut scraper = TcpStream::connect(addr).await.expect("connect");
        scraper
            .write_all(b"GET /health HTTP/1.1\r\nhost: localhost\r\n\r\n")
            .await
            .expect("write request");
        let mut response = Vec::new();
        while !response.ends_with(b"\r\n\r\nok") {
            let mut chunk = [0u8; 512];
            let read = scraper.read(&mut chunk).await.expect("read response");
            assert_ne!(read, 0, "connection closed before the response arrived");
            response.extend_from_slice(&chunk[..read]);
        }
        assert!(response.starts_with(b"HTTP/1.1 200 OK"));

        broadcaster.signal();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("server held on to an idle connection")
            .expect("server task panicked");

        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(1), scraper.read_to_end(&mut rest))
            .await
            .expect("idle connection was not closed")
            .expect("read after shutdown");
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn bare_port_means_every_interface() {
        let addrs = resolve(":9100").await.expect("must resolve");
        assert_eq!(
            addrs,
            vec![
                SocketAddr::from((Ipv6Addr::UNSPECIFIED, 9100)),
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9100)),
            ]
        );

        let addrs = resolve("127.0.0.1:9200").await.expect("must resolve");
        assert_eq!(addrs, vec![SocketAddr::from((Ipv4Addr::LOCALHOST, 9200))]);
    }

    #[tokio::test]
    async fn unresolvable_addresses() {
        for addr in ["bogus", "localhost:notaport", "", ":notaport", ":70000"] {
            let err = resolve(addr).await.expect_err(addr);
            assert!(matches!(err, Error::Resolve { .. }), "{addr}: {err}");
        }
    }
}
