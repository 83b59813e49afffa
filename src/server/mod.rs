//! TCP server running one shell session per accepted connection

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::session::{CommandRouter, SessionConfig, ShellSession};
use crate::transport::TcpChannel;

/// How long aborted sessions get to close their channels
const ABORT_TIMEOUT: Duration = Duration::from_secs(1);

/// Error types for server operations
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("session limiter closed")]
    LimiterClosed,
}

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub max_sessions: usize,
    pub shutdown_grace: Duration,
    pub session: SessionConfig,
}

impl From<&Config> for ServerConfig {
    fn from(config: &Config) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            max_sessions: config.max_sessions,
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
            session: SessionConfig::from(config),
        }
    }
}

/// Accept loop handing connections to sessions
pub struct ShellServer {
    listener: TcpListener,
    router: Arc<CommandRouter>,
    config: ServerConfig,
    shutdown: CancellationToken,
    abort: CancellationToken,
    next_session_id: AtomicU64,
}

impl ShellServer {
    /// Bind the listener
    pub async fn bind(config: ServerConfig, router: Arc<CommandRouter>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;

        Ok(Self {
            listener,
            router,
            config,
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            next_session_id: AtomicU64::new(1),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the server when cancelled. Every session receives a
    /// child of this token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the shutdown token is cancelled
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            "Accepting connections on {} (max {} sessions)",
            self.config.listen_addr, self.config.max_sessions
        );

        let limiter = Arc::new(Semaphore::new(self.config.max_sessions.max(1)));
        let mut sessions = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = limiter.clone().acquire_owned() => {
                    permit.map_err(|_| ServerError::LimiterClosed)?
                }
            };

            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // Per-connection failures (reset before accept, fd
                        // exhaustion) leave the listener usable
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            info!(session = id, %peer, "Accepted connection");

            let session = ShellSession::new(
                id,
                TcpChannel::from_tcp(stream),
                self.router.clone(),
                self.config.session.clone(),
                self.shutdown.child_token(),
            )
            .with_abort(self.abort.clone());

            sessions.spawn(async move {
                let _permit = permit;
                match session.run().await {
                    Ok(report) => {
                        info!(session = id, outcome = ?report.outcome, "Session ended")
                    }
                    Err(e) => error!(session = id, "Session failed: {}", e),
                }
            });

            while let Some(finished) = sessions.try_join_next() {
                if let Err(e) = finished {
                    error!("Session task failed: {}", e);
                }
            }
        }

        self.drain(sessions).await;
        info!("Server stopped");
        Ok(())
    }

    /// Give open sessions the grace period to notice cancellation, then
    /// abort whatever is still blocked on a read. Aborted sessions close
    /// their channels; tasks stuck inside a handler are dropped last.
    async fn drain(&self, mut sessions: JoinSet<()>) {
        if sessions.is_empty() {
            return;
        }

        info!("Waiting for {} open sessions", sessions.len());
        if join_all(&mut sessions, self.config.shutdown_grace).await {
            debug!("All sessions finished");
            return;
        }

        warn!("Aborting {} sessions after grace period", sessions.len());
        self.abort.cancel();
        if join_all(&mut sessions, ABORT_TIMEOUT).await {
            return;
        }

        error!("Dropping {} unresponsive sessions", sessions.len());
        sessions.shutdown().await;
    }
}

/// Wait up to `limit` for every task in `sessions`; true if all finished
async fn join_all(sessions: &mut JoinSet<()>, limit: Duration) -> bool {
    tokio::time::timeout(limit, async {
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                error!("Session task failed: {}", e);
            }
        }
    })
    .await
    .is_ok()
}
