use crate::config::Config;
use crate::payload::{Payload, PayloadError};
use crate::request::Proxy;
use crate::snapshot::Snapshot;
use crate::store::SnapshotStore;
use http::uri::Scheme;
use hyper::{server::conn::Http, service::service_fn};
use std::convert::{Infallible, TryFrom};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// The ingress proxy: a plaintext and a TLS listener sharing one snapshot.
pub struct Server {
    config: Config,
    store: Arc<SnapshotStore>,
    proxy: Arc<Proxy>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self::with_store(config, Arc::new(SnapshotStore::default()))
    }

    /// Creates a server reading from an existing store, so several servers
    /// (e.g. on different addresses) follow the same updates.
    pub fn with_store(config: Config, store: Arc<SnapshotStore>) -> Self {
        let proxy = Arc::new(Proxy::new(store.clone(), config.upstream_timeout));

        Server { config, store, proxy }
    }

    /// Installs a new snapshot. Requests that start after this returns are
    /// routed with it; requests already in flight finish with the one they
    /// started with.
    pub fn update(&self, snapshot: Snapshot) {
        info!(
            "Installing snapshot with {} host(s) and {} certificate(s).",
            snapshot.rules().len(),
            snapshot.certificate_hosts().count()
        );
        self.store.update(snapshot);
    }

    /// Builds a snapshot from the watcher's payload and installs it. When the
    /// payload is rejected the current snapshot stays in effect.
    pub fn update_payload(&self, payload: Payload) -> Result<(), PayloadError> {
        let snapshot = Snapshot::try_from(payload)?;
        self.update(snapshot);
        Ok(())
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.store.current()
    }

    /// Runs both listeners until `shutdown` is cancelled.
    ///
    /// Fails if either listener cannot be bound. After cancellation both
    /// sockets are closed, open connections are asked to finish their
    /// current request and are dropped once `shutdown_timeout` has passed.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let http = bind(&self.config.host, self.config.port).await?;
        let https = bind(&self.config.host, self.config.tls_port).await?;

        info!(
            "Listening for HTTP on {} and HTTPS on {}.",
            http.local_addr().map_err(ServerError::LocalAddr)?,
            https.local_addr().map_err(ServerError::LocalAddr)?
        );

        let acceptor = crate::tls::create_acceptor(self.store.clone())?;
        let force_close = CancellationToken::new();
        let (drain_tx, mut drain_rx) = mpsc::channel::<()>(1);

        let plain = Listener {
            scheme: Scheme::HTTP,
            acceptor: None,
            proxy: self.proxy.clone(),
            shutdown: shutdown.clone(),
            force_close: force_close.clone(),
            drain: drain_tx.clone(),
        };
        let secure = Listener {
            scheme: Scheme::HTTPS,
            acceptor: Some(acceptor),
            proxy: self.proxy.clone(),
            shutdown: shutdown.clone(),
            force_close: force_close.clone(),
            drain: drain_tx,
        };

        tokio::join!(plain.accept_loop(http), secure.accept_loop(https));

        info!("Listeners closed, draining open connections.");

        // Every connection task holds a sender; recv returns None once all are gone.
        if tokio::time::timeout(self.config.shutdown_timeout, drain_rx.recv())
            .await
            .is_err()
        {
            warn!(
                "Connections still open after {:?}, closing them.",
                self.config.shutdown_timeout
            );
            force_close.cancel();
        }

        info!("Server stopped.");

        Ok(())
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, ServerError> {
    TcpListener::bind((host, port))
        .await
        .map_err(|source| ServerError::Bind {
            address: format!("{}:{}", host, port),
            source,
        })
}

struct Listener {
    scheme: Scheme,
    acceptor: Option<TlsAcceptor>,
    proxy: Arc<Proxy>,
    shutdown: CancellationToken,
    force_close: CancellationToken,
    drain: mpsc::Sender<()>,
}

impl Listener {
    async fn accept_loop(self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, addr)) => {
                    debug!("Connection accepted from {}.", addr);
                    self.spawn_connection(socket, addr);
                }
                Err(e) => {
                    // Usually transient (e.g. out of file descriptors).
                    error!("Failed to accept {} connection: {}", self.scheme, e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        debug!("Stopped accepting {} connections.", self.scheme);
    }

    fn spawn_connection(&self, socket: tokio::net::TcpStream, addr: SocketAddr) {
        let acceptor = self.acceptor.clone();
        let connection = Connection {
            remote: addr,
            scheme: self.scheme.clone(),
            proxy: self.proxy.clone(),
            shutdown: self.shutdown.clone(),
            force_close: self.force_close.clone(),
        };
        let drain = self.drain.clone();

        tokio::spawn(async move {
            let result = match acceptor {
                Some(acceptor) => {
                    let handshake = tokio::select! {
                        _ = connection.shutdown.cancelled() => return,
                        handshake = acceptor.accept(socket) => handshake,
                    };
                    match handshake {
                        Ok(stream) => connection.serve(stream).await,
                        Err(e) => {
                            info!("TLS handshake with {} failed: {}", addr, e);
                            return;
                        }
                    }
                }
                None => connection.serve(socket).await,
            };

            if let Err(http_err) = result {
                debug!("Error while serving HTTP connection from {}: {}", addr, http_err);
            }

            drop(drain);
        });
    }
}

struct Connection {
    remote: SocketAddr,
    scheme: Scheme,
    proxy: Arc<Proxy>,
    shutdown: CancellationToken,
    force_close: CancellationToken,
}

impl Connection {
    async fn serve<I>(self, io: I) -> Result<(), hyper::Error>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Connection {
            remote,
            scheme,
            proxy,
            shutdown,
            force_close,
        } = self;

        let service = service_fn(move |req| {
            let proxy = proxy.clone();
            let scheme = scheme.clone();
            async move { Ok::<_, Infallible>(proxy.handle(req, remote, scheme).await) }
        });

        let conn = Http::new().serve_connection(io, service);
        tokio::pin!(conn);

        tokio::select! {
            res = conn.as_mut() => return res,
            _ = shutdown.cancelled() => {}
        }

        // Finish the request in progress, then close.
        conn.as_mut().graceful_shutdown();
        tokio::select! {
            res = conn.as_mut() => res,
            _ = force_close.cancelled() => Ok(()),
        }
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
    #[error("Failed to read the local address of a listener: {0}")]
    LocalAddr(std::io::Error),
    #[error("Failed to configure TLS: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
}
