//! Server role: serve one client at a time from a file backend.
//!
//! The server listens on a Unix socket and hands each accepted connection to
//! a fresh [`SessionManager`]. While a client is active, further
//! connections are accepted and closed at once. The process ends after the
//! configured idle timeout or when the shutdown token fires.

use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendConnector;
use crate::config::Config;
use crate::processor::{ProcessorContext, Role, TransferSettings};
use crate::reactor::{drive, idle_expired};
use crate::session::{IdleTimer, SessionManager, SessionSettings};
use crate::transport::{Transport, UnixTransport};

/// Unix socket server answering share requests.
pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    connector: Arc<dyn BackendConnector>,
    session_settings: SessionSettings,
    transfer: TransferSettings,
    idle_timeout: Duration,
    idle: Arc<IdleTimer>,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind the server socket.
    ///
    /// Parent directories are created and a stale socket file is removed
    /// first.
    pub async fn bind(config: &Config, connector: Arc<dyn BackendConnector>) -> Result<Self> {
        let socket_path = config.connector.socket_path.clone();
        let listener = listen(&socket_path, config.connector.accept_backlog)
            .with_context(|| format!("Failed to bind {}", socket_path.display()))?;

        info!("Listening on {}", socket_path.display());
        Ok(Self {
            listener,
            socket_path,
            connector,
            session_settings: SessionSettings::from(&config.buffers),
            transfer: TransferSettings::from_config(config),
            idle_timeout: Duration::from_secs(config.connector.idle_timeout),
            idle: Arc::new(IdleTimer::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve clients until idle timeout or shutdown.
    pub async fn run(self) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = idle_expired(&self.idle, self.idle_timeout) => {
                    info!("No activity for {}s, exiting", self.idle_timeout.as_secs());
                    break;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, _addr)) => {
                    self.idle.reset();
                    self.serve(stream).await;
                    self.idle.reset();
                }
                Err(err) => warn!("Accept failed: {}", err),
            }
        }

        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            debug!("Could not remove {}: {}", self.socket_path.display(), err);
        }
        Ok(())
    }

    async fn serve(&self, stream: UnixStream) {
        info!("Client connected");
        let transport = Arc::new(UnixTransport::new(stream));
        let session = Arc::new(SessionManager::new(
            self.session_settings.clone(),
            self.idle.clone(),
            self.shutdown.child_token(),
        ));
        session.init(transport.clone());

        let (ctx, _outcome) = ProcessorContext::new(
            session.clone(),
            Some(self.connector.clone()),
            self.transfer.clone(),
            Role::Responder,
        );
        if let Err(err) = session.start_worker(ctx, None) {
            warn!("Failed to start processing worker: {}", err);
            transport.shutdown();
            return;
        }

        let cancel = session.cancel_token().clone();
        let reactor = drive(&transport, &session, &cancel);
        tokio::pin!(reactor);

        loop {
            tokio::select! {
                result = &mut reactor => {
                    match result {
                        Ok(()) => debug!("Session cancelled"),
                        Err(err) => info!("Client disconnected: {}", err),
                    }
                    break;
                }
                extra = self.listener.accept() => {
                    if let Ok((stream, _addr)) = extra {
                        warn!("Rejecting connection while a client is active");
                        drop(stream);
                    }
                }
                _ = idle_expired(&self.idle, self.idle_timeout) => {
                    info!("No activity for {}s, closing session", self.idle_timeout.as_secs());
                    self.shutdown.cancel();
                    break;
                }
            }
        }

        transport.shutdown();
        let quitting = session.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || quitting.quit()).await {
            warn!("Session teardown failed: {}", err);
        }
    }
}

/// Bind a non-blocking listening socket with an explicit backlog.
fn listen(path: &Path, backlog: u32) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }

    let fd = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(path)?;
    socket::bind(fd.as_raw_fd(), &addr)?;
    let backlog = Backlog::new(backlog.max(1) as i32)?;
    socket::listen(&fd, backlog)?;

    UnixListener::from_std(StdUnixListener::from(fd))
}
