use std::sync::Arc;

use tracing::debug;

use super::state::ReadAnswer;
use super::{Interrupt, Session};
use crate::mailbox::{ActorId, Message};
use crate::protocol::{DebugKind, ServerEvent, Sexp};
use crate::runtime::{Console, EvalError};

const RESULT_CHANNEL: &str = "repl-result";

/// Standard I/O of one evaluation actor, routed through its session.
pub struct SessionConsole {
    session: Arc<Session>,
    actor: ActorId,
    interrupt: Interrupt,
}

impl SessionConsole {
    pub fn new(session: Arc<Session>, actor: ActorId, interrupt: Interrupt) -> Self {
        Self {
            session,
            actor,
            interrupt,
        }
    }

    /// Send a prompt built from a fresh tag and block until it is answered.
    fn prompt(&self, event: impl FnOnce(u64) -> ServerEvent) -> Result<ReadAnswer, EvalError> {
        let pending = self.session.pending();
        let (tag, rx) = pending.register(self.actor);
        self.emit(event(tag));

        // An interrupt raised before registration found nothing to abort.
        if self.interrupt.is_raised() {
            pending.abort_actor(self.actor);
        }

        match rx.blocking_recv() {
            Ok(answer) => Ok(answer),
            Err(_) => {
                debug!("Input request {} of actor {} aborted", tag, self.actor);
                self.emit(ServerEvent::ReadAborted {
                    thread: self.actor.get(),
                    tag,
                });
                Err(EvalError::InputAborted)
            }
        }
    }
}

impl Console for SessionConsole {
    fn write_output(&self, text: &str) {
        if !self.session.write_dedicated(text) {
            self.emit(ServerEvent::write_string(text));
        }
    }

    fn write_result(&self, text: &str) {
        self.emit(ServerEvent::WriteString {
            text: text.to_string(),
            channel: Some(RESULT_CHANNEL.to_string()),
        });
    }

    fn read_line(&self) -> Result<String, EvalError> {
        let thread = self.actor.get();
        match self.prompt(|tag| ServerEvent::ReadString { thread, tag })? {
            ReadAnswer::Text(text) => Ok(text),
            ReadAnswer::Value(value) => Ok(value.display_value()),
        }
    }

    fn y_or_n(&self, prompt: &str) -> Result<bool, EvalError> {
        let thread = self.actor.get();
        let answer = self.prompt(|tag| ServerEvent::YOrNP {
            thread,
            tag,
            prompt: prompt.to_string(),
        })?;
        Ok(match answer {
            ReadAnswer::Value(value) => value.is_truthy(),
            ReadAnswer::Text(text) => text.trim_start().starts_with(['y', 'Y']),
        })
    }

    fn emit(&self, event: ServerEvent) {
        self.session.to_control(Message::Emit(event));
    }

    fn debug(&self, kind: DebugKind, rest: Vec<Sexp>) {
        self.session.to_control(Message::Debug {
            actor: self.actor,
            kind,
            rest,
        });
    }

    fn request_quit(&self) {
        self.session.request_quit();
    }
}
