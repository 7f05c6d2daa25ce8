use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use color_eyre::eyre::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::mqtt::router::Router;
use crate::mqtt::session::{Session, SessionId, SessionState};
use crate::mqtt::socket::{DirectSocket, MqttSocket};
use crate::mqtt::Error;

/// Connection counters.
#[derive(Debug, Default)]
pub struct Stats {
    total: AtomicU64,
    active: AtomicU64,
}

impl Stats {
    /// Every connection ever served.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Connections currently being served.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    fn connected(self: &Arc<Self>) -> ActiveGuard {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard(self.clone())
    }
}

/// Counts a connection as active until dropped.
struct ActiveGuard(Arc<Stats>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Everything needed to serve a connection, independent of how it was accepted.
#[derive(Clone)]
pub struct BrokerCore {
    config: Arc<BrokerConfig>,
    router: Arc<Router>,
    stats: Arc<Stats>,
    next_session_id: Arc<AtomicU64>,
}

impl BrokerCore {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config: Arc::new(config),
            router: Arc::new(Router::new()),
            stats: Arc::default(),
            next_session_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Serve one connection until it closes or `token` is cancelled.
    #[tracing::instrument(name = "serve", skip_all, fields(remote_addr = %socket.remote_addr()))]
    pub async fn serve(&self, socket: impl MqttSocket, token: CancellationToken) -> Result<(), Error> {
        let _active = self.stats.connected();

        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));

        let state = Arc::new(SessionState::new(
            id,
            socket.remote_addr(),
            &self.config,
            token.child_token(),
        ));

        Session::new(state, self.config.clone(), self.router.clone())
            .run(socket)
            .await
    }
}

pub struct MqttBroker {
    listen_addr: SocketAddr,

    listener: TcpListener,

    token: CancellationToken,

    tasks: JoinSet<Result<(), Error>>,

    core: BrokerCore,
}

impl MqttBroker {
    /// Listen on `addr`, e.g. `0.0.0.0:1883`.
    pub async fn bind(addr: &str, config: BrokerConfig) -> crate::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("failed to bind {addr}"))?;

        let listen_addr = listener
            .local_addr()
            .wrap_err("failed to get local address of listener")?;

        Ok(MqttBroker {
            listen_addr,
            listener,
            token: CancellationToken::new(),
            tasks: JoinSet::new(),
            core: BrokerCore::new(config),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn core(&self) -> &BrokerCore {
        &self.core
    }

    /// Cancelling this token makes [`run()`](Self::run) return.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Accept connections until the broker's token is cancelled.
    ///
    /// Cancel safe: can be raced against other futures and called again.
    pub async fn run(&mut self) -> crate::Result<()> {
        tracing::info!(listen_addr = %self.listen_addr, "listening for connections");

        let accept_timeout = self.core.config.accept_timeout;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    break;
                }
                Some(res) = self.tasks.join_next() => {
                    handle_session_result(res);
                }
                res = tokio::time::timeout(accept_timeout, self.listener.accept()) => {
                    // On timeout we simply go around again, checking the token.
                    if let Ok(res) = res {
                        self.handle_accept(res);
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_accept(&mut self, result: std::io::Result<(TcpStream, SocketAddr)>) {
        match result {
            Ok((stream, remote_addr)) => {
                tracing::info!(%remote_addr, "connection received");

                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(%remote_addr, "failed to set TCP_NODELAY: {e}");
                }

                let core = self.core.clone();
                let token = self.token.clone();

                self.tasks.spawn(async move {
                    core.serve(DirectSocket::new(remote_addr, stream), token)
                        .await
                });
            }
            Err(e) => tracing::error!(?e, "accept failed"),
        }
    }

    pub fn connections(&self) -> usize {
        self.tasks.len()
    }

    /// Stop accepting, end every session and wait for them to finish.
    pub async fn shutdown(mut self) -> crate::Result<()> {
        drop(self.listener);

        self.token.cancel();

        while let Some(res) = self.tasks.join_next().await {
            handle_session_result(res);
            tracing::info!("{} connections remaining", self.tasks.len());
        }

        Ok(())
    }
}

fn handle_session_result(res: Result<Result<(), Error>, JoinError>) {
    match res {
        Ok(Ok(())) => (),
        Ok(Err(e)) => tracing::debug!("session closed with error: {e}"),
        Err(e) => tracing::error!("{:?}", crate::map_join_error(e)),
    }
}
