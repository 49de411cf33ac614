/// Connection server
///
/// Accepts stream connections (TCP or Unix socket), admits them into a
/// bounded session pool and runs one [`Session`] per connection on its own
/// task. Sessions never share buffers or detector state; the pool semaphore
/// and the counters are the only shared mutable state.

use crate::detector::WakeEngine;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::info::service_info;
use crate::protocol::{ErrorMessage, Info, Message, WyomingCodec};
use crate::session::{Flow, Session, SessionError, SessionId, SessionSettings, SessionState};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Default listening URI
pub const DEFAULT_URI: &str = "tcp://0.0.0.0:10400";

/// Longest flush of a session's pending events once shutdown starts
const SHUTDOWN_FLUSH: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("Invalid server configuration: {0}")]
    InvalidConfig(String),

    #[error("Server task failed: {0}")]
    Task(String),
}

/// What to do with a connection when every session slot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Refuse immediately with a `capacity` error
    #[default]
    Reject,

    /// Wait up to `queue_timeout` for a free slot
    Queue,
}

/// Connection server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Concurrent session limit
    pub max_sessions: usize,

    pub overflow: OverflowPolicy,

    /// Longest wait for a slot under [`OverflowPolicy::Queue`]
    pub queue_timeout: Duration,

    /// Window for `audio-start` (or the first audio) after connecting
    pub negotiation_timeout: Duration,

    /// Longest silence on the read side while streaming, and the longest a
    /// client may leave outbound events unread
    pub idle_timeout: Duration,

    /// Interval of outbound `ping` events, disabled when `None`
    pub keepalive: Option<Duration>,

    /// Outbound events buffered per connection
    pub outbox_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            overflow: OverflowPolicy::Reject,
            queue_timeout: Duration::from_secs(5),
            negotiation_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            keepalive: None,
            outbox_capacity: crate::dispatcher::DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_sessions == 0 {
            return Err(ServerError::InvalidConfig(
                "max_sessions must be at least 1".to_string(),
            ));
        }

        if self.max_sessions > Semaphore::MAX_PERMITS {
            return Err(ServerError::InvalidConfig(format!(
                "max_sessions must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }

        if self.negotiation_timeout.is_zero() || self.idle_timeout.is_zero() {
            return Err(ServerError::InvalidConfig(
                "timeouts must be greater than zero".to_string(),
            ));
        }

        if self.outbox_capacity == 0 {
            return Err(ServerError::InvalidConfig(
                "outbox_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Where the server listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port`
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse `tcp://host:port` or `unix:///path/to/socket`
    pub fn parse(uri: &str) -> Result<Self, ServerError> {
        let invalid = |reason: &str| ServerError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let url = url::Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;

        match url.scheme() {
            "tcp" => {
                let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
                let port = url.port().ok_or_else(|| invalid("missing port"))?;
                Ok(Endpoint::Tcp(format!("{}:{}", host, port)))
            }
            "unix" => {
                let mut path = url.host_str().unwrap_or_default().to_string();
                path.push_str(url.path());
                if path.is_empty() {
                    return Err(invalid("missing socket path"));
                }
                Ok(Endpoint::Unix(PathBuf::from(path)))
            }
            other => Err(invalid(&format!("unsupported scheme '{}'", other))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

/// State shared by the accept loop and every session task
struct Shared {
    engine: Arc<dyn WakeEngine>,
    settings: Arc<SessionSettings>,
    info: Arc<Info>,
    config: ServerConfig,
    slots: Arc<Semaphore>,
    active: AtomicUsize,
    rejected: AtomicU64,
    next_id: AtomicU64,
}

impl Shared {
    /// Wait for a session slot according to the overflow policy
    async fn admit(&self, shutdown: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        match self.config.overflow {
            OverflowPolicy::Reject => self.slots.clone().try_acquire_owned().ok(),
            OverflowPolicy::Queue => {
                let wait = tokio::time::timeout(
                    self.config.queue_timeout,
                    self.slots.clone().acquire_owned(),
                );

                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    permit = wait => permit.ok().and_then(Result::ok),
                }
            }
        }
    }
}

/// Counts a running session for as long as it lives
struct ActiveSession(Arc<Shared>);

impl ActiveSession {
    fn enter(shared: Arc<Shared>) -> Self {
        shared.active.fetch_add(1, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bound, not yet running, wake-word server
pub struct WakeServer {
    listener: Listener,
    endpoint: Endpoint,
    shared: Arc<Shared>,
}

impl WakeServer {
    /// Bind the listener; nothing is accepted until [`run`](Self::run)
    pub async fn bind(
        endpoint: &Endpoint,
        engine: Arc<dyn WakeEngine>,
        settings: SessionSettings,
        config: ServerConfig,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let bind_error = |source: io::Error| ServerError::Bind {
            endpoint: endpoint.clone(),
            source,
        };

        let (listener, endpoint) = match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await.map_err(bind_error)?;
                let local = listener.local_addr().map_err(bind_error)?;
                (Listener::Tcp(listener), Endpoint::Tcp(local.to_string()))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if path.exists() {
                    debug!("Removing stale socket {}", path.display());
                    std::fs::remove_file(path).map_err(bind_error)?;
                }
                let listener = UnixListener::bind(path).map_err(bind_error)?;
                (
                    Listener::Unix(listener, path.clone()),
                    Endpoint::Unix(path.clone()),
                )
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => {
                return Err(bind_error(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                )))
            }
        };

        let info = service_info(engine.as_ref(), settings.language);

        info!(
            "Listening on {} (max {} sessions, overflow {:?})",
            endpoint, config.max_sessions, config.overflow
        );

        Ok(Self {
            listener,
            endpoint,
            shared: Arc::new(Shared {
                engine,
                settings: Arc::new(settings),
                info: Arc::new(info),
                slots: Arc::new(Semaphore::new(config.max_sessions)),
                config,
                active: AtomicUsize::new(0),
                rejected: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Endpoint actually bound (port resolved for `tcp://host:0`)
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(..) => None,
        }
    }

    /// Run the accept loop on a background task
    pub fn spawn(self) -> ServerHandle {
        let shutdown = CancellationToken::new();
        let shared = self.shared.clone();
        let endpoint = self.endpoint.clone();
        let local_addr = self.local_addr();
        let task = tokio::spawn(self.run(shutdown.clone()));

        ServerHandle {
            shared,
            endpoint,
            local_addr,
            shutdown,
            task,
        }
    }

    /// Accept connections until `shutdown` is cancelled
    ///
    /// Running sessions are cancelled too; this returns once all of them
    /// have released their detectors.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                accepted = accept(&self.listener) => match accepted {
                    Ok(connection) => {
                        let shared = self.shared.clone();
                        let token = shutdown.child_token();
                        sessions.spawn(connection.serve(shared, token));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },

                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        error!("Session task failed: {}", e);
                    }
                }
            }
        }

        info!("Shutting down, {} connections open", sessions.len());
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                error!("Session task failed: {}", e);
            }
        }

        remove_socket(&self.listener);
        info!("Server stopped");
        Ok(())
    }
}

/// Control handle for a spawned server
pub struct ServerHandle {
    shared: Arc<Shared>,
    endpoint: Endpoint,
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), ServerError>>,
}

impl ServerHandle {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Sessions holding a pool slot right now
    pub fn active_sessions(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Connections turned away because the pool was full
    pub fn rejected_connections(&self) -> u64 {
        self.shared.rejected.load(Ordering::SeqCst)
    }

    /// Stop accepting, cancel running sessions and wait for teardown
    pub async fn shutdown(self) -> Result<(), ServerError> {
        self.shutdown.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ServerError::Task(e.to_string())),
        }
    }
}

fn remove_socket(listener: &Listener) {
    match listener {
        #[cfg(unix)]
        Listener::Unix(_, path) => {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("Could not remove socket {}: {}", path.display(), e);
            }
        }
        _ => {}
    }
}

enum Connection {
    Tcp(tokio::net::TcpStream, SocketAddr),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

async fn accept(listener: &Listener) -> io::Result<Connection> {
    match listener {
        Listener::Tcp(listener) => {
            let (stream, peer) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY: {}", e);
            }
            Ok(Connection::Tcp(stream, peer))
        }
        #[cfg(unix)]
        Listener::Unix(listener, _) => {
            let (stream, _) = listener.accept().await?;
            Ok(Connection::Unix(stream))
        }
    }
}

impl Connection {
    async fn serve(self, shared: Arc<Shared>, shutdown: CancellationToken) {
        match self {
            Connection::Tcp(stream, peer) => serve(shared, stream, peer.to_string(), shutdown).await,
            #[cfg(unix)]
            Connection::Unix(stream) => serve(shared, stream, "unix".to_string(), shutdown).await,
        }
    }
}

/// Admit one connection and run its session to completion
async fn serve<S>(shared: Arc<Shared>, stream: S, peer: String, shutdown: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let permit = match shared.admit(&shutdown).await {
        Some(permit) => permit,
        None => {
            let rejected = shared.rejected.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                "Rejecting connection from {}: all {} sessions busy ({} rejected so far)",
                peer, shared.config.max_sessions, rejected
            );
            let deadline = shared.config.negotiation_timeout;
            if tokio::time::timeout(deadline, reject(stream, shared.config.max_sessions))
                .await
                .is_err()
            {
                debug!("Rejected client from {} is not reading", peer);
            }
            return;
        }
    };

    let id = SessionId(shared.next_id.fetch_add(1, Ordering::SeqCst));
    let active = ActiveSession::enter(shared.clone());
    let span = info_span!("session", id = %id, peer = %peer);

    run_session(&shared, id, stream, &shutdown).instrument(span).await;

    // Detector is released inside run_session, before the slot frees
    drop(active);
    drop(permit);
}

/// Tell a client the pool is full, then hang up
async fn reject<S>(stream: S, max_sessions: usize)
where
    S: AsyncWrite + Unpin,
{
    let message = ErrorMessage {
        text: format!("Server is at capacity ({} sessions)", max_sessions),
        code: Some(crate::error::ErrorKind::ResourceExhaustion.code().to_string()),
    };

    let mut sink = FramedWrite::new(stream, WyomingCodec::new());
    if let Err(e) = sink.send(message.to_event()).await {
        debug!("Could not send capacity error: {}", e);
    }
    if let Err(e) = sink.close().await {
        debug!("Could not close rejected connection: {}", e);
    }
}

async fn run_session<S>(shared: &Shared, id: SessionId, stream: S, shutdown: &CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let config = &shared.config;
    let (reader, writer) = tokio::io::split(stream);
    let dispatcher = Dispatcher::spawn(
        writer,
        config.outbox_capacity,
        Some(config.idle_timeout),
        config.keepalive,
    );
    let mut events = FramedRead::new(reader, WyomingCodec::new());

    let mut session = Session::new(
        id,
        shared.engine.clone(),
        shared.settings.clone(),
        shared.info.clone(),
        dispatcher.outbox(),
    );

    info!("Session started");

    loop {
        let negotiating = session.state() == SessionState::Negotiating;
        let window = if negotiating {
            config.negotiation_timeout
        } else {
            config.idle_timeout
        };

        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Server shutting down");
                session.close();
                break;
            }
            next = tokio::time::timeout(window, events.next()) => next,
        };

        match next {
            Err(_) => {
                let err = if negotiating {
                    SessionError::NegotiationTimeout(window)
                } else {
                    SessionError::IdleTimeout(window)
                };
                fail(&mut session, &err, shutdown).await;
                break;
            }
            Ok(None) => {
                debug!("Peer closed the connection");
                session.close();
                break;
            }
            Ok(Some(Err(e))) => {
                fail(&mut session, &SessionError::from(e), shutdown).await;
                break;
            }
            Ok(Some(Ok(event))) => {
                // Replies can block on a full outbox
                let handled = tokio::select! {
                    _ = shutdown.cancelled() => None,
                    handled = session.handle_event(event) => Some(handled),
                };

                match handled {
                    Some(Ok(Flow::Continue)) => {}
                    Some(Ok(Flow::Close)) | Some(Err(_)) => break,
                    None => {
                        debug!("Server shutting down");
                        session.close();
                        break;
                    }
                }
            }
        }
    }

    let stats = session.stats();
    let state = session.state();
    drop(session);

    let grace = if shutdown.is_cancelled() {
        config.idle_timeout.min(SHUTDOWN_FLUSH)
    } else {
        config.idle_timeout
    };

    match dispatcher.close(grace).await {
        Ok(written) => debug!("Flushed {} events", written),
        Err(DispatchError::Stalled(_)) => warn!("Client stopped reading, dropping unsent events"),
        Err(e) => debug!("Writer ended with error: {}", e),
    }

    info!(
        "Session ended ({}): {} chunks, {} frames, {} detections",
        state, stats.chunks, stats.frames, stats.detections
    );
}

/// Report `err` unless the server is shutting down first
async fn fail(session: &mut Session, err: &SessionError, shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => session.close(),
        _ = session.fail(err) => {}
    }
}
