//! One accepted connection and the actors that serve it.
//!
//! A session owns four kinds of actor, each a tokio task with its own
//! mailbox: the reader pump, the control (dispatch) loop, a persistent REPL
//! and any number of one-shot workers. The session is passed explicitly to
//! every actor; nothing is bound per thread.

mod actors;
mod console;
mod state;


use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::{CodingSystem, CommunicationStyle, ServerConfig};
use crate::dispatch::Dispatcher;
use crate::mailbox::{ActorId, MailboxRegistry, Message};
use crate::protocol::ThreadSpec;
use crate::runtime::{ConnectionInfo, Runtime};
use crate::server::QuitSignal;
use crate::{pump, worker};

pub use actors::{spawn_actor, ActorHandle, Interrupt, CONTROL_NAME, READER_NAME, REPL_NAME};
pub use console::SessionConsole;
pub use state::{ActiveEvaluations, IndentationCache, PendingReads, ReadAnswer};

/// Every actor the session has started, by role.
#[derive(Debug, Default)]
pub(crate) struct ActorTable {
    pub reader: Option<ActorHandle>,
    pub control: Option<ActorHandle>,
    pub repl: Option<ActorHandle>,
    pub workers: HashMap<ActorId, ActorHandle>,
    pub helpers: Vec<AbortHandle>,
}

impl ActorTable {
    fn evaluators(&self) -> impl Iterator<Item = &ActorHandle> {
        self.repl.iter().chain(self.workers.values())
    }
}

pub struct Session {
    id: u64,
    style: CommunicationStyle,
    coding: CodingSystem,
    dedicated_output: bool,
    runtime: Arc<Runtime>,
    mailboxes: Arc<MailboxRegistry>,
    quit: Arc<QuitSignal>,
    reader_id: ActorId,
    control_id: ActorId,
    actors: Mutex<ActorTable>,
    active: ActiveEvaluations,
    pending: PendingReads,
    indentation: IndentationCache,
    output: Mutex<Option<UnboundedSender<String>>>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(
        id: u64,
        config: &ServerConfig,
        runtime: Arc<Runtime>,
        mailboxes: Arc<MailboxRegistry>,
        quit: Arc<QuitSignal>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            style: config.style,
            coding: config.coding_system,
            dedicated_output: config.dedicated_output,
            runtime,
            reader_id: mailboxes.allocate(),
            control_id: mailboxes.allocate(),
            mailboxes,
            quit,
            actors: Mutex::default(),
            active: ActiveEvaluations::default(),
            pending: PendingReads::default(),
            indentation: IndentationCache::default(),
            output: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Serve the connection until the reader or the control loop stops, then
    /// tear everything down.
    pub async fn run<R, W>(self: Arc<Self>, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        info!(
            "Session {} started: style={}, coding={}",
            self.id,
            self.style,
            self.coding.name()
        );

        let (control, control_task) = spawn_actor(self.control_id, CONTROL_NAME, |_| {
            Dispatcher::new(Arc::clone(&self), writer).run()
        });
        let (reader_handle, reader_task) = spawn_actor(self.reader_id, READER_NAME, |_| {
            pump::read_loop(Arc::clone(&self), reader)
        });
        {
            let mut actors = self.actors();
            actors.control = Some(control);
            actors.reader = Some(reader_handle);
        }

        worker::ensure_repl(&self);
        if self.dedicated_output {
            if let Err(e) = pump::open_dedicated_output(&self).await {
                warn!("Session {}: dedicated output unavailable: {}", self.id, e);
            }
        }
        self.mailboxes.send(self.reader_id, Message::Begin);

        tokio::select! {
            _ = reader_task => debug!("Session {}: reader finished", self.id),
            _ = control_task => debug!("Session {}: control loop finished", self.id),
        }
        self.close();
        info!("Session {} ended", self.id);
    }

    /// Kill every actor and abort every pending prompt. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let actors = std::mem::take(&mut *self.actors());
        for handle in actors
            .reader
            .iter()
            .chain(actors.control.iter())
            .chain(actors.evaluators())
        {
            handle.kill();
        }
        for helper in &actors.helpers {
            helper.abort();
        }
        self.pending.abort_all();
        self.output.lock().unwrap_or_else(PoisonError::into_inner).take();
        debug!("Session {} torn down", self.id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn coding(&self) -> CodingSystem {
        self.coding
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            style: self.style,
            coding: self.coding,
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn mailboxes(&self) -> &MailboxRegistry {
        &self.mailboxes
    }

    pub fn reader_id(&self) -> ActorId {
        self.reader_id
    }

    pub fn control_id(&self) -> ActorId {
        self.control_id
    }

    pub fn active(&self) -> &ActiveEvaluations {
        &self.active
    }

    pub fn pending(&self) -> &PendingReads {
        &self.pending
    }

    pub fn indentation(&self) -> &IndentationCache {
        &self.indentation
    }

    pub fn to_control(&self, msg: Message) {
        self.mailboxes.send(self.control_id, msg);
    }

    pub fn request_quit(&self) {
        info!("Session {} requested quit", self.id);
        self.quit.request();
    }

    pub(crate) fn actors(&self) -> MutexGuard<'_, ActorTable> {
        self.actors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn repl_id(&self) -> Option<ActorId> {
        self.actors()
            .repl
            .as_ref()
            .filter(|repl| repl.is_alive())
            .map(ActorHandle::id)
    }

    /// Find a live evaluation actor by numeric id or display name.
    pub fn find_actor(&self, spec: &ThreadSpec) -> Option<ActorId> {
        let actors = self.actors();
        let found = actors.evaluators().find(|handle| match spec {
            ThreadSpec::Id(n) => handle.id().get() == *n,
            ThreadSpec::Name(name) => handle.name() == name.as_str(),
            ThreadSpec::Repl => handle.name() == REPL_NAME,
            ThreadSpec::Any => false,
        });
        found.filter(|handle| handle.is_alive()).map(ActorHandle::id)
    }

    /// Oldest active evaluation whose actor is still alive.
    pub fn first_running(&self) -> Option<ActorId> {
        let actors = self.actors();
        let running = self.active.first_where(|actor| {
            actors
                .evaluators()
                .any(|handle| handle.id() == actor && handle.is_alive())
        });
        running
    }

    pub fn actor_name(&self, actor: ActorId) -> Option<String> {
        let actors = self.actors();
        let name = actors
            .reader
            .iter()
            .chain(actors.control.iter())
            .chain(actors.evaluators())
            .find(|handle| handle.id() == actor)
            .map(|handle| handle.name().to_string());
        name
    }

    /// Raise the actor's interrupt, then abort its pending prompts.
    pub fn interrupt_actor(&self, actor: ActorId) -> bool {
        let raised = {
            let actors = self.actors();
            let raised = match actors.evaluators().find(|handle| handle.id() == actor) {
                Some(handle) => {
                    handle.interrupt().raise();
                    true
                }
                None => false,
            };
            raised
        };
        if raised {
            let aborted = self.pending.abort_actor(actor);
            debug!("Interrupted actor {} ({} prompts aborted)", actor, aborted);
        }
        raised
    }

    pub(crate) fn add_helper(&self, task: AbortHandle) {
        self.actors().helpers.push(task);
    }

    pub(crate) fn install_output(&self, sender: UnboundedSender<String>) {
        *self.output.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    pub(crate) fn clear_output(&self) {
        self.output.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn has_dedicated_output(&self) -> bool {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Queue `text` on the dedicated output stream. False if there is none.
    pub fn write_dedicated(&self, text: &str) -> bool {
        let output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        match output.as_ref() {
            Some(sender) => sender.send(text.to_string()).is_ok(),
            None => false,
        }
    }
}
