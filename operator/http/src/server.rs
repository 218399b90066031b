use crate::{
    allocate::{ActivateGameServer, Allocate},
    router::Router,
    transport::{CertificateMaterial, Io, Listener, TransportError},
    Body,
};
use gameserver_operator_core::Runnable;
use gameserver_operator_k8s_index::SharedCache;
use http::{Request, Response};
use hyper::{body::Incoming, server::conn::http1};
use hyper_util::{
    rt::{TokioIo, TokioTimer},
    service::TowerToHyperService,
};
use std::{
    convert::Infallible,
    fmt, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
};
use thiserror::Error;
use tokio::{
    sync::{oneshot, watch},
    task::JoinSet,
    time,
};
use tracing::{debug, debug_span, info, warn, Instrument};

pub const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5000);

pub const DEFAULT_SHUTDOWN_GRACE_PERIOD: time::Duration = time::Duration::from_secs(10);

/// Delay before accepting again after a failed accept, e.g. when file descriptors are exhausted.
const ACCEPT_BACKOFF: time::Duration = time::Duration::from_secs(1);

/// The address the API server listens on.
///
/// Accepts `host:port` socket addresses as well as `:port`, which listens on all interfaces. An
/// empty value selects [`DEFAULT_LISTEN_ADDR`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ListenAddr(SocketAddr);

#[derive(Debug, Error)]
#[error("invalid listen address {0:?}: expected host:port or :port")]
pub struct InvalidListenAddr(String);

#[derive(Clone, Debug, Default)]
pub struct ApiServerConfig {
    pub addr: ListenAddr,
    pub tls: Option<CertificateMaterial>,
    pub shutdown_grace_period: Option<time::Duration>,
}

/// The lifecycle of an [`ApiServer`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Idle,
    Serving(SocketAddr),
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to bind {addr}: {source}")]
    BindFailure {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Transport(TransportError),

    #[error("connections did not complete within {grace_period:?}")]
    ShutdownFailure { grace_period: time::Duration },
}

/// Serves the allocation API until shutdown is signaled.
pub struct ApiServer<H> {
    router: Router<H>,
    config: ApiServerConfig,
    state: watch::Sender<State>,
    ready: Option<Box<dyn Send>>,
}

/// Waits for the process to begin shutdown and drains the server's connections.
struct GracefulShutdown {
    close: Option<oneshot::Sender<()>>,
    conns: drain::Signal,
    grace_period: time::Duration,
    state: watch::Sender<State>,
}

type Completion = (Result<(), ServiceError>, drain::ReleaseShutdown);

// === impl ListenAddr ===

impl ListenAddr {
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl Default for ListenAddr {
    fn default() -> Self {
        Self(DEFAULT_LISTEN_ADDR)
    }
}

impl From<SocketAddr> for ListenAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for ListenAddr {
    type Err = InvalidListenAddr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }
        if let Some(port) = s.strip_prefix(':') {
            let port = port
                .parse::<u16>()
                .map_err(|_| InvalidListenAddr(s.to_string()))?;
            return Ok(Self(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port,
            )));
        }
        s.parse()
            .map(Self)
            .map_err(|_| InvalidListenAddr(s.to_string()))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl ApiServerConfig ===

impl ApiServerConfig {
    fn grace_period(&self) -> time::Duration {
        self.shutdown_grace_period
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE_PERIOD)
    }
}

// === impl ServiceError ===

impl From<TransportError> for ServiceError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Bind { addr, source } => Self::BindFailure { addr, source },
            error => Self::Transport(error),
        }
    }
}

// === impl ApiServer ===

impl<A: ActivateGameServer> ApiServer<Allocate<A>> {
    pub fn new(cache: SharedCache, activator: A, config: ApiServerConfig) -> Self {
        Self::with_handler(Allocate::new(cache, activator), config)
    }
}

impl<H> ApiServer<H> {
    /// Builds a server that routes allocation requests to `allocate`.
    pub fn with_handler(allocate: H, config: ApiServerConfig) -> Self {
        let (state, _) = watch::channel(State::Idle);
        Self {
            router: Router::new(allocate),
            config,
            state,
            ready: None,
        }
    }

    /// Holds `handle` until the server is listening.
    ///
    /// The handle is dropped once the listener is bound. It is never released if binding fails.
    pub fn with_readiness(mut self, handle: impl Send + 'static) -> Self {
        self.ready = Some(Box::new(handle));
        self
    }

    pub fn state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }
}

impl<H> ApiServer<H>
where
    H: tower::Service<Request<Incoming>, Response = Response<Body>, Error = Infallible>,
    H: Clone + Send + 'static,
    H::Future: Send + 'static,
{
    /// Serves requests until `shutdown` is signaled.
    ///
    /// Returns only after the listener has been closed and open connections have completed or
    /// been aborted. Startup failures are returned; failures while shutting down are logged.
    pub async fn serve(self, shutdown: drain::Watch) -> Result<(), ServiceError> {
        let Self {
            router,
            config,
            state,
            ready,
        } = self;

        let listener =
            match Listener::bind(config.addr.socket_addr(), config.tls.as_ref()).await {
                Ok(listener) => listener,
                Err(error) => {
                    state.send_replace(State::Stopped);
                    std::mem::forget(ready);
                    return Err(error.into());
                }
            };
        let addr = listener.local_addr();
        info!(%addr, tls = listener.is_tls(), "API server listening");
        state.send_replace(State::Serving(addr));
        drop(ready);

        let (close_tx, mut close_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let (conns_signal, conns_watch) = drain::channel();
        tokio::spawn(
            GracefulShutdown {
                close: Some(close_tx),
                conns: conns_signal,
                grace_period: config.grace_period(),
                state: state.clone(),
            }
            .run(shutdown, done_tx),
        );

        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                biased;

                _ = &mut close_rx => break,

                Some(res) = conns.join_next() => {
                    if let Err(error) = res {
                        if error.is_panic() {
                            warn!(%error, "Connection task panicked");
                        }
                    }
                }

                res = listener.accept() => match res {
                    Ok((conn, peer)) => {
                        let router = router.clone();
                        let drain = conns_watch.clone();
                        conns.spawn(
                            async move {
                                match conn.handshake().await {
                                    Ok(io) => serve_connection(io, router, drain).await,
                                    Err(error) => debug!(%error, "Connection handshake failed"),
                                }
                            }
                            .instrument(debug_span!("conn", %peer)),
                        );
                    }
                    Err(error) => {
                        warn!(%error, "Failed to accept connection");
                        tokio::select! {
                            _ = &mut close_rx => break,
                            _ = time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                },
            }
        }

        // Stop accepting connections and release our handle on the connection drain so that it
        // completes once the remaining connections have.
        drop(listener);
        drop(conns_watch);
        debug!(%addr, "Listener closed");

        let release = match done_rx.await {
            Ok((res, release)) => {
                if let Err(error) = res {
                    warn!(%error, "Connections aborted");
                }
                Some(release)
            }
            // The coordinator only exits without completing if its task was cancelled.
            Err(_) => None,
        };
        conns.shutdown().await;

        state.send_replace(State::Stopped);
        info!(%addr, "API server stopped");
        drop(release);
        Ok(())
    }
}

#[async_trait::async_trait]
impl<H> Runnable for ApiServer<H>
where
    H: tower::Service<Request<Incoming>, Response = Response<Body>, Error = Infallible>,
    H: Clone + Send + 'static,
    H::Future: Send + 'static,
{
    fn name(&self) -> &'static str {
        "api-server"
    }

    /// Every replica serves allocations.
    fn need_leader_election(&self) -> bool {
        false
    }

    async fn start(self: Box<Self>, shutdown: drain::Watch) -> anyhow::Result<()> {
        self.serve(shutdown).await?;
        Ok(())
    }
}

impl<H> fmt::Debug for ApiServer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiServer")
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

async fn serve_connection<H>(io: Io, router: Router<H>, drain: drain::Watch)
where
    H: tower::Service<Request<Incoming>, Response = Response<Body>, Error = Infallible>,
    H: Clone + Send + 'static,
    H::Future: Send + 'static,
{
    tokio::pin! {
        let conn = http1::Builder::new()
            .timer(TokioTimer::new())
            .serve_connection(TokioIo::new(io), TowerToHyperService::new(router));
    }

    let res = tokio::select! {
        res = (&mut conn) => res,
        release = drain.signaled() => {
            conn.as_mut().graceful_shutdown();
            release.release_after(conn).await
        }
    };
    if let Err(error) = res {
        debug!(%error, "Connection failed");
    }
}

// === impl GracefulShutdown ===

impl GracefulShutdown {
    /// Stops the accept loop. Subsequent calls have no effect.
    fn close(&mut self) {
        if let Some(tx) = self.close.take() {
            let _ = tx.send(());
        }
    }

    async fn run(mut self, shutdown: drain::Watch, done: oneshot::Sender<Completion>) {
        let release = shutdown.signaled().await;
        info!(grace_period = ?self.grace_period, "Shutting down API server");
        self.state.send_replace(State::ShuttingDown);
        self.close();

        let grace_period = self.grace_period;
        let res = match time::timeout(grace_period, self.conns.drain()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(ServiceError::ShutdownFailure { grace_period }),
        };
        let _ = done.send((res, release));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_listen_addrs() {
        assert_eq!(
            ":5000".parse::<ListenAddr>().unwrap(),
            ListenAddr::default()
        );
        assert_eq!("".parse::<ListenAddr>().unwrap(), ListenAddr::default());
        assert_eq!(
            "127.0.0.1:8080".parse::<ListenAddr>().unwrap().socket_addr(),
            SocketAddr::from(([127, 0, 0, 1], 8080))
        );
        assert_eq!(
            "[::1]:8080".parse::<ListenAddr>().unwrap().socket_addr(),
            "[::1]:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(ListenAddr::default().to_string(), "0.0.0.0:5000");

        for invalid in [":", ":http", "localhost", "127.0.0.1", ":70000"] {
            assert!(invalid.parse::<ListenAddr>().is_err(), "{invalid}");
        }
    }

    #[test]
    fn bind_errors_are_bind_failures() {
        let err = ServiceError::from(TransportError::Bind {
            addr: DEFAULT_LISTEN_ADDR,
            source: io::ErrorKind::AddrInUse.into(),
        });
        assert!(matches!(err, ServiceError::BindFailure { addr, .. } if addr == DEFAULT_LISTEN_ADDR));

        let err = ServiceError::from(TransportError::InvalidCertificate("bad".to_string()));
        assert!(matches!(
            err,
            ServiceError::Transport(TransportError::InvalidCertificate(_))
        ));
    }

    #[tokio::test]
    async fn closing_twice_is_noop() {
        let (close_tx, mut close_rx) = oneshot::channel();
        let (conns, _) = drain::channel();
        let (state, _) = watch::channel(State::Idle);
        let mut shutdown = GracefulShutdown {
            close: Some(close_tx),
            conns,
            grace_period: DEFAULT_SHUTDOWN_GRACE_PERIOD,
            state,
        };

        shutdown.close();
        shutdown.close();
        assert_eq!(close_rx.try_recv(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn reports_drain_timeout() {
        let (close_tx, _close_rx) = oneshot::channel();
        let (conns, conn) = drain::channel();
        let (state, state_rx) = watch::channel(State::Serving(DEFAULT_LISTEN_ADDR));
        let grace_period = time::Duration::from_secs(3);
        let coordinator = GracefulShutdown {
            close: Some(close_tx),
            conns,
            grace_period,
            state,
        };

        let (signal, shutdown) = drain::channel();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(coordinator.run(shutdown, done_tx));

        // The connection never completes, so the process-level drain must wait on the coordinator.
        let drained = tokio::spawn(signal.drain());

        let (res, release) = done_rx.await.expect("coordinator must complete");
        assert!(matches!(
            res,
            Err(ServiceError::ShutdownFailure { grace_period: d }) if d == grace_period
        ));
        assert_eq!(*state_rx.borrow(), State::ShuttingDown);
        assert!(!drained.is_finished());

        drop(release);
        drop(conn);
        drained.await.unwrap();
    }
}
