//! Listener lifecycle: bind, accept, authenticate and hand each connection
//! to a [`Session`].
//!
//! Listeners are recorded by their bound port so they can be stopped and
//! restarted while the process keeps running.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::{CommunicationStyle, ServerConfig};
use crate::mailbox::MailboxRegistry;
use crate::protocol::handshake::{authenticate, load_secret};
use crate::runtime::Runtime;
use crate::session::Session;

/// Pause between stopping and re-binding a port on restart.
pub const RESTART_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write port file {path}: {source}")]
    PortFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no listener on port {0}")]
    UnknownPort(u16),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Raised once by a quit request; the process then shuts down.
#[derive(Debug, Default)]
pub struct QuitSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl QuitSignal {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
struct ListenerEntry {
    style: CommunicationStyle,
    keep_listening: bool,
    /// Wakes the accept loop so it drops the socket.
    stop: Arc<Notify>,
}

pub struct Server {
    config: ServerConfig,
    runtime: Arc<Runtime>,
    mailboxes: Arc<MailboxRegistry>,
    quit: Arc<QuitSignal>,
    listeners: Mutex<HashMap<u16, ListenerEntry>>,
    sessions: Mutex<Vec<Weak<Session>>>,
    last_session: AtomicU64,
}

impl Server {
    pub fn new(config: ServerConfig, runtime: Runtime) -> Arc<Self> {
        Arc::new(Self {
            config,
            runtime: Arc::new(runtime),
            mailboxes: Arc::new(MailboxRegistry::new()),
            quit: Arc::new(QuitSignal::default()),
            listeners: Mutex::default(),
            sessions: Mutex::default(),
            last_session: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn quit_signal(&self) -> Arc<QuitSignal> {
        Arc::clone(&self.quit)
    }

    pub async fn wait_for_quit(&self) {
        self.quit.wait().await;
    }

    /// Ports with a registered listener, ascending.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Bind `port` (0 picks a free one) and start accepting.
    ///
    /// With [`CommunicationStyle::Spawn`] accepting happens on a background
    /// task and this returns at once. With [`CommunicationStyle::None`]
    /// connections are served on the calling task, and this returns once the
    /// listener closes.
    pub async fn listen(
        self: &Arc<Self>,
        port: u16,
        style: CommunicationStyle,
        keep_listening: bool,
    ) -> Result<u16, ListenerError> {
        let addr = format!("{}:{}", self.config.host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let actual = listener.local_addr()?.port();
        info!(
            "Listening on {}:{} (style={}, keep_listening={})",
            self.config.host, actual, style, keep_listening
        );

        if let Some(path) = &self.config.port_file {
            std::fs::write(path, format!("{actual}\n")).map_err(|source| {
                ListenerError::PortFile {
                    path: path.clone(),
                    source,
                }
            })?;
            debug!("Wrote port {} to {:?}", actual, path);
        }

        let stop = Arc::new(Notify::new());
        self.listeners().insert(
            actual,
            ListenerEntry {
                style,
                keep_listening,
                stop: Arc::clone(&stop),
            },
        );

        let accept = Arc::clone(self).accept_loop(listener, actual, stop, style, keep_listening);
        match style {
            CommunicationStyle::Spawn => {
                tokio::spawn(accept);
            }
            CommunicationStyle::None => accept.await,
        }
        Ok(actual)
    }

    /// Close the socket on `port`. Unknown ports are ignored. Sessions
    /// already accepted keep running.
    pub fn stop(&self, port: u16) -> bool {
        match self.listeners().remove(&port) {
            Some(entry) => {
                entry.stop.notify_one();
                info!("Stopped listener on port {}", port);
                true
            }
            None => {
                debug!("No listener on port {} to stop", port);
                false
            }
        }
    }

    /// Stop `port` and listen on it again with the same settings.
    pub async fn restart(self: &Arc<Self>, port: u16) -> Result<u16, ListenerError> {
        let (style, keep_listening) = {
            let listeners = self.listeners();
            let entry = listeners.get(&port).ok_or(ListenerError::UnknownPort(port))?;
            (entry.style, entry.keep_listening)
        };
        self.stop(port);
        tokio::time::sleep(RESTART_SETTLE).await;
        self.listen(port, style, keep_listening).await
    }

    /// Stop every listener and close every live session.
    pub fn shutdown(&self) {
        for port in self.ports() {
            self.stop(port);
        }
        let sessions = std::mem::take(
            &mut *self.sessions.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for session in sessions.iter().filter_map(Weak::upgrade) {
            session.close();
        }
        info!("Server shut down");
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, HashMap<u16, ListenerEntry>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        port: u16,
        stop: Arc<Notify>,
        style: CommunicationStyle,
        keep_listening: bool,
    ) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = stop.notified() => {
                    debug!("Listener on port {} stopping", port);
                    break;
                }
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer)) => {
                    info!("New connection from {} on port {}", peer, port);
                    let server = Arc::clone(&self);
                    match style {
                        CommunicationStyle::Spawn => {
                            tokio::spawn(server.serve_connection(socket, peer, style));
                        }
                        CommunicationStyle::None => server.serve_connection(socket, peer, style).await,
                    }
                    if !keep_listening {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to accept connection on port {}: {}", port, e);
                }
            }
        }
        drop(listener);
        {
            let mut listeners = self.listeners();
            if listeners
                .get(&port)
                .is_some_and(|entry| Arc::ptr_eq(&entry.stop, &stop))
            {
                listeners.remove(&port);
            }
        }
        debug!("Listener on port {} closed", port);
    }

    async fn serve_connection(
        self: Arc<Self>,
        socket: TcpStream,
        peer: SocketAddr,
        style: CommunicationStyle,
    ) {
        let coding = self.config.coding_system;
        let secret = match load_secret(self.config.secret_file.as_deref()) {
            Ok(secret) => secret,
            Err(e) => {
                warn!("Rejecting {}: {}", peer, e);
                return;
            }
        };

        let (mut reader, writer) = socket.into_split();
        if let Err(e) = authenticate(&mut reader, secret.as_deref(), coding).await {
            warn!("Rejecting {}: {}", peer, e);
            return;
        }

        let id = self.last_session.fetch_add(1, Ordering::SeqCst) + 1;
        let config = ServerConfig {
            style,
            ..self.config.clone()
        };
        let session = Session::new(
            id,
            &config,
            Arc::clone(&self.runtime),
            Arc::clone(&self.mailboxes),
            Arc::clone(&self.quit),
        );
        {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            sessions.retain(|weak| weak.strong_count() > 0);
            sessions.push(Arc::downgrade(&session));
        }
        session.run(reader, writer).await;
        info!("Connection from {} closed", peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with(config: ServerConfig) -> Arc<Server> {
        Server::new(config, Runtime::builtin(Vec::new()))
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            secret_file: None,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn listen_records_port_and_writes_port_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let port_file = dir.path().join("port");
        let server = server_with(ServerConfig {
            port_file: Some(port_file.clone()),
            ..test_config()
        });

        let port = server
            .listen(0, CommunicationStyle::Spawn, true)
            .await
            .expect("listen");
        assert_ne!(port, 0);
        assert_eq!(server.ports(), vec![port]);

        let written = std::fs::read_to_string(&port_file).expect("port file");
        assert_eq!(written.trim(), port.to_string());
        server.shutdown();
        assert!(server.ports().is_empty());
    }

    #[tokio::test]
    async fn stop_unknown_port_is_a_noop() {
        let server = server_with(test_config());
        assert!(!server.stop(1));
        assert!(matches!(
            server.restart(1).await,
            Err(ListenerError::UnknownPort(1))
        ));
    }

    #[tokio::test]
    async fn stop_closes_an_inline_listener() {
        let server = server_with(test_config());
        let inline = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.listen(0, CommunicationStyle::None, true).await })
        };
        let port = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(port) = server.ports().first().copied() {
                    return port;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener registered");

        assert!(server.stop(port));
        let returned = tokio::time::timeout(Duration::from_secs(2), inline)
            .await
            .expect("listen returns after stop")
            .expect("listen task")
            .expect("listen");
        assert_eq!(returned, port);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
        assert!(server.ports().is_empty());
    }

    #[tokio::test]
    async fn quit_signal_wakes_waiters() {
        let quit = Arc::new(QuitSignal::default());
        let waiter = {
            let quit = Arc::clone(&quit);
            tokio::spawn(async move { quit.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        quit.request();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter wakes")
            .expect("waiter task");
        // Already requested: returns at once.
        quit.wait().await;
    }
}
