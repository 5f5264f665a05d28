//! The control loop: one per session, sole writer of the wire.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWrite;
use tracing::{debug, error, info, warn};

use crate::mailbox::{ActorId, Message};
use crate::protocol::{ClientEvent, FrameWriter, SendError, ServerEvent, ThreadSpec};
use crate::session::{ReadAnswer, Session};
use crate::worker;

/// An evaluation request named an actor the session does not have.
#[derive(Debug, Error)]
#[error("no live actor matches {actor:?}")]
pub struct UnknownActorError {
    pub actor: ThreadSpec,
}

pub struct Dispatcher<W> {
    session: Arc<Session>,
    writer: FrameWriter<W>,
}

impl<W: AsyncWrite + Unpin + Send> Dispatcher<W> {
    pub fn new(session: Arc<Session>, writer: W) -> Self {
        let coding = session.coding();
        Self {
            session,
            writer: FrameWriter::new(writer, coding),
        }
    }

    /// Route messages until the connection can no longer be written.
    pub async fn run(mut self) {
        let mailbox = self
            .session
            .mailboxes()
            .mailbox_for(self.session.control_id());
        loop {
            let msg = mailbox.receive().await;
            if let Err(e) = self.dispatch(msg).await {
                error!("Session {}: write failed, stopping control loop: {}", self.session.id(), e);
                break;
            }
        }
    }

    async fn dispatch(&mut self, msg: Message) -> io::Result<()> {
        match msg {
            Message::Client(event) => self.handle_client(event),
            Message::EvaluationResult { actor, status, id } => {
                self.session.active().remove(actor);
                self.write(ServerEvent::Return { status, id }).await?;
            }
            Message::Debug { actor, kind, rest } => {
                let thread = self
                    .session
                    .actor_name(actor)
                    .unwrap_or_else(|| actor.to_string());
                self.write(ServerEvent::Debug { kind, thread, rest }).await?;
            }
            Message::Emit(event) => self.write(event).await?,
            other @ (Message::Begin | Message::Evaluate { .. }) => {
                warn!("Control loop ignoring {:?}", other);
            }
        }
        Ok(())
    }

    fn handle_client(&self, event: ClientEvent) {
        match event {
            ClientEvent::EvaluationRequest {
                form,
                namespace,
                thread,
                id,
            } => match self.resolve(&thread) {
                Ok(actor) => {
                    debug!("Request {} -> actor {}", id, actor);
                    self.session.active().add(actor);
                    self.session.mailboxes().send(
                        actor,
                        Message::Evaluate {
                            form,
                            namespace,
                            id,
                        },
                    );
                }
                Err(e) => warn!("Dropping request {}: {}", id, e),
            },
            ClientEvent::InterruptRequest { thread } => self.interrupt(&thread),
            ClientEvent::ReturnString { tag, text, .. } => {
                self.answer(tag, ReadAnswer::Text(text));
            }
            ClientEvent::ReturnValue { tag, value, .. } => {
                self.answer(tag, ReadAnswer::Value(value));
            }
            ClientEvent::Unknown(msg) => warn!("Dropping unrecognized message {}", msg),
        }
    }

    fn resolve(&self, thread: &ThreadSpec) -> Result<ActorId, UnknownActorError> {
        match thread {
            ThreadSpec::Any => Ok(worker::spawn_one_shot(&self.session)),
            ThreadSpec::Repl => Ok(worker::ensure_repl(&self.session)),
            other => self
                .session
                .find_actor(other)
                .ok_or_else(|| UnknownActorError {
                    actor: other.clone(),
                }),
        }
    }

    fn interrupt(&self, thread: &ThreadSpec) {
        let target = match thread {
            ThreadSpec::Any => self
                .session
                .first_running()
                .or_else(|| self.session.repl_id()),
            ThreadSpec::Repl => self.session.repl_id(),
            other => self.session.find_actor(other),
        };
        match target {
            Some(actor) if self.session.interrupt_actor(actor) => {
                info!("Session {}: interrupted actor {}", self.session.id(), actor);
            }
            _ => debug!("Interrupt for {:?} found no running actor", thread),
        }
    }

    fn answer(&self, tag: u64, answer: ReadAnswer) {
        if !self.session.pending().resolve(tag, answer) {
            debug!("No input request waiting on tag {}", tag);
        }
    }

    /// Encoding failures lose only this message; I/O failures end the loop.
    async fn write(&mut self, event: ServerEvent) -> io::Result<()> {
        match self.writer.send(&event.to_sexp()).await {
            Ok(()) => Ok(()),
            Err(SendError::Encoding(e)) => {
                warn!("Session {}: dropping outgoing message: {}", self.session.id(), e);
                Ok(())
            }
            Err(SendError::Io(e)) => Err(e),
        }
    }
}
