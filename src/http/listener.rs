//! Accept loop for the HTTP adapter

use super::session::Session;
use axum::Router;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

/// Pause after a failed accept (e.g. file descriptor exhaustion)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bound HTTP socket
pub struct Listener {
    listener: TcpListener,
    app: Router,
    connection_limit: Arc<Semaphore>,
}

impl Listener {
    /// Bind `addr`; failure here is a startup error
    pub async fn bind(addr: SocketAddr, app: Router, max_connections: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_tcp(listener, app, max_connections))
    }

    pub fn from_tcp(listener: TcpListener, app: Router, max_connections: usize) -> Self {
        Self {
            listener,
            app,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// Each connection runs in its own task. On shutdown the loop stops
    /// accepting, tells every open session to finish its current request, and
    /// returns once all of them have closed.
    pub async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        let mut next_id: u64 = 0;
        tokio::pin!(shutdown);

        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(addr = %addr, "HTTP listener accepting connections");
        }

        loop {
            let permit = tokio::select! {
                permit = self.connection_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = &mut shutdown => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };

            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, peer = %peer, "Failed to set TCP_NODELAY");
            }

            next_id += 1;
            let session = Session::new(next_id, stream, peer, self.app.clone());
            let stop = stop_rx.clone();
            sessions.spawn(async move {
                session.run(stop).await;
                drop(permit);
            });

            // Reap finished sessions
            while let Some(result) = sessions.try_join_next() {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Session task failed");
                }
            }
        }

        tracing::info!(open_sessions = sessions.len(), "HTTP listener stopping");
        let _ = stop_tx.send(true);
        while let Some(result) = sessions.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Session task failed");
            }
        }
        tracing::info!("HTTP listener stopped");
    }
}
