//! Evaluation actors: the persistent REPL and one-shot workers.
//!
//! Both receive `Evaluate` items from their own mailbox and answer the
//! control loop with an `EvaluationResult`. Evaluator failures never escape:
//! they are described to the client with `write-string` and reported as an
//! abort.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::mailbox::{ActorId, Message};
use crate::protocol::{ReturnStatus, ServerEvent, Sexp};
use crate::runtime::{EvalContext, EvalError};
use crate::session::{spawn_actor, Interrupt, Session, SessionConsole, REPL_NAME};

/// The live REPL actor, respawning it if it has died.
pub fn ensure_repl(session: &Arc<Session>) -> ActorId {
    let mut actors = session.actors();
    if let Some(repl) = actors.repl.as_ref() {
        if repl.is_alive() {
            return repl.id();
        }
        let dead = repl.id();
        warn!("Session {}: REPL actor {} is dead, respawning", session.id(), dead);
        session.active().remove(dead);
        session.pending().abort_actor(dead);
    }

    let id = session.mailboxes().allocate();
    let (handle, _) = spawn_actor(id, REPL_NAME, |interrupt| {
        repl_loop(Arc::clone(session), id, interrupt)
    });
    if session.is_closed() {
        handle.kill();
    }
    info!("Session {}: REPL actor {} started", session.id(), id);
    actors.repl = Some(handle);
    id
}

/// Start a worker that handles exactly one evaluation and exits.
pub fn spawn_one_shot(session: &Arc<Session>) -> ActorId {
    let id = session.mailboxes().allocate();
    // Held across the spawn so the worker cannot deregister before it is
    // registered.
    let mut actors = session.actors();
    let (handle, _) = spawn_actor(id, format!("worker-{id}"), |interrupt| {
        one_shot(Arc::clone(session), id, interrupt)
    });
    if session.is_closed() {
        handle.kill();
    }
    actors.workers.insert(id, handle);
    debug!("Session {}: worker {} started", session.id(), id);
    id
}

async fn repl_loop(session: Arc<Session>, actor: ActorId, interrupt: Interrupt) {
    loop {
        match session.mailboxes().receive(actor).await {
            Message::Evaluate {
                form,
                namespace,
                id,
            } => evaluate(&session, actor, &interrupt, form, namespace, id).await,
            other => warn!("REPL actor {} ignoring {:?}", actor, other),
        }
    }
}

async fn one_shot(session: Arc<Session>, actor: ActorId, interrupt: Interrupt) {
    match session.mailboxes().receive(actor).await {
        Message::Evaluate {
            form,
            namespace,
            id,
        } => evaluate(&session, actor, &interrupt, form, namespace, id).await,
        other => warn!("Worker {} ignoring {:?}", actor, other),
    }
    session.actors().workers.remove(&actor);
    debug!("Session {}: worker {} finished", session.id(), actor);
}

/// Run one work item on the blocking pool and report back to control.
async fn evaluate(
    session: &Arc<Session>,
    actor: ActorId,
    interrupt: &Interrupt,
    form: Sexp,
    namespace: String,
    id: i64,
) {
    interrupt.clear();
    debug!("Actor {} evaluating request {}: {}", actor, id, form);

    let console = Arc::new(SessionConsole::new(
        Arc::clone(session),
        actor,
        interrupt.clone(),
    ));
    let runtime = Arc::clone(session.runtime());
    let connection = session.connection_info();
    let task = tokio::task::spawn_blocking({
        let form = form.clone();
        let namespace = namespace.clone();
        let interrupt = interrupt.clone();
        move || {
            let mut ctx = EvalContext::new(namespace, actor, interrupt, console, connection);
            let result = runtime.evaluate(&form, &mut ctx);
            let changed = ctx.changed_namespace().map(str::to_string);
            (result, changed)
        }
    });

    let (result, changed) = match task.await {
        Ok(outcome) => outcome,
        Err(e) => (Err(EvalError::Panicked(e.to_string())), None),
    };

    let status = match result {
        Ok(value) => {
            if let Some(name) = &changed {
                session.to_control(Message::Emit(ServerEvent::NewPackage {
                    name: name.clone(),
                    prompt: name.clone(),
                }));
            }
            let current = changed.as_deref().unwrap_or(&namespace);
            let hints = session.runtime().introspector.indentation_hints(current);
            let delta = session.indentation().update(hints);
            if !delta.is_empty() {
                session.to_control(Message::Emit(ServerEvent::IndentationUpdate(delta)));
            }
            ReturnStatus::Ok(value)
        }
        Err(e) => {
            debug!("Actor {} request {} failed: {}", actor, id, e);
            session.to_control(Message::Emit(ServerEvent::write_string(
                e.describe(&form, &namespace),
            )));
            ReturnStatus::Abort
        }
    };

    session.to_control(Message::EvaluationResult { actor, status, id });
}
