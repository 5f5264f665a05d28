//! Collaborators consumed by the evaluation actors.
//!
//! The protocol engine never interprets code itself. It hands forms to an
//! [`Evaluator`], asks an [`Introspector`] about bindings, a
//! [`SourceLocator`] about files on disk and [`HostInfo`] about the process.
//! [`Runtime::builtin`] wires the small default implementations in this
//! module tree so the daemon is usable on its own.

mod host;
mod interp;
pub mod rpc;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::config::{CodingSystem, CommunicationStyle};
use crate::mailbox::ActorId;
use crate::protocol::{DebugKind, ServerEvent, Sexp};
use crate::session::Interrupt;

pub use host::{FsSourceLocator, SystemHost};
pub use interp::Interp;

/// Failure raised while evaluating a form. Recovered at the worker boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("{0}")]
    Raised(String),
    #[error("Unable to resolve symbol: {0} in this context")]
    Undefined(String),
    #[error("Wrong number of args ({got}) passed to: {name}")]
    Arity { name: String, got: usize },
    #[error("{0}")]
    Type(String),
    #[error("Divide by zero")]
    DivideByZero,
    #[error("Could not load {path}: {message}")]
    Load { path: String, message: String },
    #[error("Evaluation interrupted")]
    Interrupted,
    #[error("Input request aborted")]
    InputAborted,
    #[error("Evaluation panicked: {0}")]
    Panicked(String),
}

impl EvalError {
    /// Text sent to the client as `write-string` before the abort.
    pub fn describe(&self, form: &Sexp, namespace: &str) -> String {
        format!("{self}\n  while evaluating {form} in {namespace}\n")
    }
}

/// What an introspector knows about one name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Binding {
    pub name: String,
    pub namespace: String,
    pub arglist: Option<String>,
    pub doc: Option<String>,
    pub file: Option<String>,
    pub line: Option<usize>,
}

pub trait Evaluator: Send + Sync {
    fn evaluate(&self, form: &Sexp, ctx: &mut EvalContext) -> Result<Sexp, EvalError>;
}

pub trait Introspector: Send + Sync {
    fn resolve(&self, name: &str, namespace: &str) -> Option<Binding>;
    fn list_bindings_starting_with(&self, prefix: &str, namespace: &str) -> BTreeSet<String>;
    fn doc(&self, name: &str, namespace: &str) -> Option<String> {
        self.resolve(name, namespace).and_then(|binding| binding.doc)
    }
    /// Operators whose body the editor should indent specially.
    fn indentation_hints(&self, _namespace: &str) -> Vec<(String, i64)> {
        Vec::new()
    }
}

pub trait SourceLocator: Send + Sync {
    fn find_source_file(&self, name: &str, search_paths: &[PathBuf]) -> Option<PathBuf>;
}

pub trait HostInfo: Send + Sync {
    fn current_process_id(&self) -> String;
    fn working_directory(&self) -> PathBuf;
}

/// Redirected standard I/O of an evaluation actor.
///
/// Output goes to the user-output surface (a dedicated stream or
/// `write-string`), input requests go to the client as `read-string` /
/// `y-or-n-p` prompts and block until answered or aborted.
pub trait Console: Send + Sync {
    fn write_output(&self, text: &str);
    fn write_result(&self, text: &str);
    fn read_line(&self) -> Result<String, EvalError>;
    fn y_or_n(&self, prompt: &str) -> Result<bool, EvalError>;
    fn emit(&self, event: ServerEvent);
    fn debug(&self, kind: DebugKind, rest: Vec<Sexp>);
    fn request_quit(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub style: CommunicationStyle,
    pub coding: CodingSystem,
}

/// Everything one evaluation may touch, passed explicitly down the call chain.
pub struct EvalContext {
    namespace: String,
    initial_namespace: String,
    actor: ActorId,
    interrupt: Interrupt,
    console: Arc<dyn Console>,
    connection: ConnectionInfo,
}

impl EvalContext {
    pub fn new(
        namespace: impl Into<String>,
        actor: ActorId,
        interrupt: Interrupt,
        console: Arc<dyn Console>,
        connection: ConnectionInfo,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            initial_namespace: namespace.clone(),
            namespace,
            actor,
            interrupt,
            console,
            connection,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.namespace = namespace.into();
    }

    /// The new namespace if the evaluation switched away from its start.
    pub fn changed_namespace(&self) -> Option<&str> {
        (self.namespace != self.initial_namespace).then_some(self.namespace.as_str())
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    /// Cooperative cancellation point.
    pub fn check_interrupt(&self) -> Result<(), EvalError> {
        if self.interrupt.is_raised() {
            Err(EvalError::Interrupted)
        } else {
            Ok(())
        }
    }

    pub fn console(&self) -> &dyn Console {
        self.console.as_ref()
    }

    pub fn connection(&self) -> ConnectionInfo {
        self.connection
    }
}

/// The collaborator bundle shared by every session of a server.
pub struct Runtime {
    pub evaluator: Arc<dyn Evaluator>,
    pub introspector: Arc<dyn Introspector>,
    pub sources: Arc<dyn SourceLocator>,
    pub host: Arc<dyn HostInfo>,
    pub source_paths: Vec<PathBuf>,
}

impl Runtime {
    pub fn builtin(source_paths: Vec<PathBuf>) -> Self {
        let interp = Arc::new(Interp::new());
        Self {
            evaluator: interp.clone(),
            introspector: interp,
            sources: Arc::new(FsSourceLocator),
            host: Arc::new(SystemHost),
            source_paths,
        }
    }

    /// Evaluate a work item: editor RPC calls are served here, everything else
    /// goes to the evaluator.
    pub fn evaluate(&self, form: &Sexp, ctx: &mut EvalContext) -> Result<Sexp, EvalError> {
        match rpc::as_call(form) {
            Some((op, args)) => rpc::call(self, op, args, ctx),
            None => self.evaluator.evaluate(form, ctx),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::mailbox::MailboxRegistry;

    /// Console that records output and replays scripted input.
    #[derive(Default)]
    pub struct RecordingConsole {
        pub output: Mutex<String>,
        pub results: Mutex<Vec<String>>,
        pub events: Mutex<Vec<ServerEvent>>,
        pub input: Mutex<VecDeque<String>>,
        pub quit: AtomicBool,
    }

    impl Console for RecordingConsole {
        fn write_output(&self, text: &str) {
            self.output.lock().expect("output lock").push_str(text);
        }

        fn write_result(&self, text: &str) {
            self.results.lock().expect("results lock").push(text.to_string());
        }

        fn read_line(&self) -> Result<String, EvalError> {
            self.input
                .lock()
                .expect("input lock")
                .pop_front()
                .ok_or(EvalError::InputAborted)
        }

        fn y_or_n(&self, _prompt: &str) -> Result<bool, EvalError> {
            self.read_line().map(|answer| answer.starts_with('y'))
        }

        fn emit(&self, event: ServerEvent) {
            self.events.lock().expect("events lock").push(event);
        }

        fn debug(&self, _kind: DebugKind, _rest: Vec<Sexp>) {}

        fn request_quit(&self) {
            self.quit.store(true, Ordering::SeqCst);
        }
    }

    pub fn context(console: Arc<RecordingConsole>) -> (EvalContext, Interrupt) {
        let interrupt = Interrupt::new();
        let actor = MailboxRegistry::new().allocate();
        let ctx = EvalContext::new(
            "user",
            actor,
            interrupt.clone(),
            console,
            ConnectionInfo {
                style: CommunicationStyle::Spawn,
                coding: CodingSystem::Utf8Unix,
            },
        );
        (ctx, interrupt)
    }
}
