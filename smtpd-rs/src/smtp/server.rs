//! Connection supervisor.
//!
//! Owns the listening endpoints, enforces the admission cap before a single
//! byte is read from the client, hands each accepted socket to a session
//! task and tracks the active set for graceful shutdown: stop accepting,
//! give sessions a grace window to notice the cancellation token, then
//! force-close what remains.

use crate::config::{Config, ListenerConfig};
use crate::error::Result;
use crate::queue::QueueStore;
use crate::security::auth::AuthProvider;
use crate::security::rate_limit::RateLimiter;
use crate::security::tls::TlsSettings;
use crate::smtp::codec::SmtpStream;
use crate::smtp::session::{Session, SessionHandles};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct SmtpServer {
    handles: SessionHandles,
    listeners: Vec<(TcpListener, ListenerConfig)>,
    active: Arc<AtomicUsize>,
    next_connection_id: AtomicU64,
    shutdown: CancellationToken,
}

impl SmtpServer {
    /// Bind every configured endpoint. Binding happens before `run` so
    /// callers can read the actual addresses (ephemeral ports in tests).
    pub async fn bind(
        config: Arc<Config>,
        queue: Arc<dyn QueueStore>,
        limiter: Arc<RateLimiter>,
        auth: Option<Arc<dyn AuthProvider>>,
        tls: Option<Arc<TlsSettings>>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let mut listeners = Vec::new();
        for listener_config in &config.server.listen {
            let listener = TcpListener::bind(&listener_config.addr).await?;
            info!(
                "SMTP listening on {} (implicit_tls={}, submission={})",
                listener.local_addr()?,
                listener_config.implicit_tls,
                listener_config.submission
            );
            listeners.push((listener, listener_config.clone()));
        }

        Ok(Self {
            handles: SessionHandles {
                config,
                queue,
                limiter,
                auth,
                tls,
            },
            listeners,
            active: Arc::new(AtomicUsize::new(0)),
            next_connection_id: AtomicU64::new(1),
            shutdown,
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|(l, _)| l.local_addr().ok())
            .collect()
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accept until shutdown, then drain sessions within the grace window.
    pub async fn run(mut self) -> Result<()> {
        let (socket_tx, mut socket_rx) = mpsc::channel::<(TcpStream, SocketAddr, ListenerConfig)>(16);

        let mut accept_tasks = JoinSet::new();
        for (listener, listener_config) in self.listeners.drain(..) {
            let socket_tx = socket_tx.clone();
            let shutdown = self.shutdown.clone();
            accept_tasks.spawn(accept_loop(listener, listener_config, socket_tx, shutdown));
        }
        drop(socket_tx);

        let mut sessions: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = socket_rx.recv() => match accepted {
                    Some((socket, peer, listener_config)) => {
                        self.admit(&mut sessions, socket, peer, listener_config);
                    }
                    None => break,
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        accept_tasks.abort_all();
        while accept_tasks.join_next().await.is_some() {}

        let grace = self.handles.config.server.shutdown_grace();
        let open = sessions.len();
        if open > 0 {
            info!("waiting up to {:?} for {} open session(s)", grace, open);
            if timeout(grace, async {
                while sessions.join_next().await.is_some() {}
            })
            .await
            .is_err()
            {
                warn!(
                    "shutdown grace expired, force-closing {} session(s)",
                    sessions.len()
                );
                sessions.abort_all();
                while sessions.join_next().await.is_some() {}
            }
        }

        info!("SMTP server stopped");
        Ok(())
    }

    /// Admission check and session spawn. Runs only on the supervisor task,
    /// so check-then-increment on the counter cannot race.
    fn admit(
        &self,
        sessions: &mut JoinSet<()>,
        socket: TcpStream,
        peer: SocketAddr,
        listener_config: ListenerConfig,
    ) {
        let max_connections = self.handles.config.server.max_connections;
        if self.active.load(Ordering::SeqCst) >= max_connections {
            warn!("connection from {} refused: server full", peer);
            tokio::spawn(async move {
                let mut socket = socket;
                socket
                    .write_all(b"421 4.3.2 Too many connections, try again later\r\n")
                    .await
                    .ok();
                socket.shutdown().await.ok();
            });
            return;
        }
        self.active.fetch_add(1, Ordering::SeqCst);

        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let handles = self.handles.clone();
        let active = Arc::clone(&self.active);
        let shutdown = self.shutdown.clone();

        debug!("connection {} accepted from {}", id, peer);
        sessions.spawn(async move {
            let stream = if listener_config.implicit_tls {
                match handles.tls.clone() {
                    Some(tls) => match tls.acceptor().accept(socket).await {
                        Ok(tls_stream) => SmtpStream::Tls(tls_stream),
                        Err(e) => {
                            error!("connection {}: implicit TLS handshake failed: {}", id, e);
                            active.fetch_sub(1, Ordering::SeqCst);
                            return;
                        }
                    },
                    None => {
                        error!("connection {}: implicit-TLS listener without TLS settings", id);
                        active.fetch_sub(1, Ordering::SeqCst);
                        return;
                    }
                }
            } else {
                SmtpStream::Plain(socket)
            };

            Session::new(id, peer, listener_config.submission, handles, shutdown)
                .run(stream)
                .await;
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

async fn accept_loop(
    listener: TcpListener,
    listener_config: ListenerConfig,
    socket_tx: mpsc::Sender<(TcpStream, SocketAddr, ListenerConfig)>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    if socket_tx
                        .send((socket, peer, listener_config.clone()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    error!("accept failed on {}: {}", listener_config.addr, e);
                }
            },
        }
    }
}
