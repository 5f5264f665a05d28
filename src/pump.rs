//! Byte-stream ends of a session: the reader pump and the optional
//! dedicated output stream.

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::mailbox::Message;
use crate::protocol::{read_frame, ClientEvent, FramingError, ServerEvent};
use crate::session::Session;
use crate::utils::io::write_all;

/// Wait for `Begin`, then forward every decoded frame to the control loop.
/// Returns on the first framing error or when the client closes.
pub async fn read_loop<R: AsyncRead + Unpin>(session: Arc<Session>, mut reader: R) {
    let mailbox = session.mailboxes().mailbox_for(session.reader_id());
    loop {
        match mailbox.receive().await {
            Message::Begin => break,
            other => warn!("Reader ignoring {:?} before begin", other),
        }
    }
    debug!("Session {}: reader started", session.id());

    loop {
        match read_frame(&mut reader, session.coding()).await {
            Ok(msg) => session.to_control(Message::Client(ClientEvent::from_sexp(msg))),
            Err(FramingError::Closed) => {
                info!("Session {}: client closed the connection", session.id());
                break;
            }
            Err(e) => {
                error!("Session {}: {}", session.id(), e);
                break;
            }
        }
    }
}

/// Bind a loopback port for user output and announce it to the client.
pub async fn open_dedicated_output(session: &Arc<Session>) -> io::Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();
    let (tx, rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(serve_output(Arc::clone(session), listener, tx, rx));
    session.add_helper(task.abort_handle());
    session.to_control(Message::Emit(ServerEvent::OpenDedicatedOutputStream { port }));
    info!("Session {}: dedicated output on port {}", session.id(), port);
    Ok(())
}

async fn serve_output(
    session: Arc<Session>,
    listener: TcpListener,
    tx: UnboundedSender<String>,
    mut rx: UnboundedReceiver<String>,
) {
    let (mut stream, peer) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("Session {}: dedicated output accept failed: {}", session.id(), e);
            return;
        }
    };
    drop(listener);
    debug!("Session {}: dedicated output connected from {}", session.id(), peer);
    session.install_output(tx);

    while let Some(text) = rx.recv().await {
        let bytes = match session.coding().encode(&text) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Session {}: dropping output: {}", session.id(), e);
                continue;
            }
        };
        if let Err(e) = write_all(&mut stream, &bytes).await {
            warn!("Session {}: dedicated output closed: {}", session.id(), e);
            break;
        }
    }
    session.clear_output();
}
