use crate::acceptor::ConnectionAcceptor;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::ServerResult;
use crate::resource::Resource;
use crate::session::SessionStore;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Flips the server's accept loop off from another thread
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// The listening server.
///
/// Every accepted connection gets its own thread. Nothing bounds how many
/// run at once.
pub struct Server {
    acceptor: ConnectionAcceptor,
    config: Arc<ServerConfig>,
    resource: Arc<dyn Resource>,
    sessions: Arc<SessionStore>,
    running: Arc<AtomicBool>,
}

impl Server {
    /// Bind the listening socket. Nothing is accepted until [`Server::run`].
    pub fn bind(config: ServerConfig, resource: Arc<dyn Resource>) -> ServerResult<Self> {
        let acceptor = ConnectionAcceptor::bind(&config)?;
        info!("Listening on {}", acceptor.local_addr());

        let sessions = Arc::new(SessionStore::new(config.session_timeout));
        Ok(Self {
            acceptor,
            config: Arc::new(config),
            resource,
            sessions,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Accept connections until shut down. The session sweeper runs for
    /// as long as this does. Connections already being served finish on
    /// their own threads.
    pub fn run(&self) -> ServerResult<()> {
        let _sweeper = self
            .sessions
            .spawn_sweeper(self.config.session_sweep_interval)?;

        while self.running.load(Ordering::SeqCst) {
            let (stream, peer_addr, id) = match self.acceptor.accept() {
                Ok(Some(accepted)) => accepted,
                Ok(None) => continue,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    thread::sleep(ACCEPT_ERROR_BACKOFF);
                    continue;
                }
            };

            let connection = match Connection::new(
                stream,
                peer_addr,
                id,
                Arc::clone(&self.config),
                Arc::clone(&self.resource),
                Arc::clone(&self.sessions),
            ) {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("Dropping connection from {}: {}", peer_addr, e);
                    continue;
                }
            };

            let spawned = thread::Builder::new()
                .name(format!("conn-{}", id))
                .spawn(move || connection.run());
            if let Err(e) = spawned {
                error!("Cannot start handler for {}: {}", peer_addr, e);
            }
        }

        info!(
            "Server on {} stopped after {} connections",
            self.local_addr(),
            self.acceptor.connection_count()
        );
        Ok(())
    }
}
