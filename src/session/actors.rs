use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

use crate::mailbox::ActorId;

pub const READER_NAME: &str = "reader-thread";
pub const CONTROL_NAME: &str = "control-thread";
pub const REPL_NAME: &str = "repl-thread";

/// Advisory interrupt flag, polled by the evaluator at its check points.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A running actor as seen by its owner.
#[derive(Debug)]
pub struct ActorHandle {
    id: ActorId,
    name: String,
    interrupt: Interrupt,
    abort: AbortHandle,
    alive: Arc<AtomicBool>,
}

impl ActorHandle {
    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stop the actor. Safe to call on an actor that already finished.
    pub fn kill(&self) {
        debug!("Killing actor {} ({})", self.name, self.id);
        self.interrupt.raise();
        self.abort.abort();
    }
}

/// Marks the actor dead when its task finishes, panics or is aborted.
struct LivenessGuard(Arc<AtomicBool>);

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Start `body` as a task with its own interrupt flag.
pub fn spawn_actor<F, Fut>(id: ActorId, name: impl Into<String>, body: F) -> (ActorHandle, JoinHandle<()>)
where
    F: FnOnce(Interrupt) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let interrupt = Interrupt::new();
    let alive = Arc::new(AtomicBool::new(true));
    let guard = LivenessGuard(Arc::clone(&alive));
    let work = body(interrupt.clone());

    let task = tokio::spawn(async move {
        let _guard = guard;
        work.await;
    });
    let handle = ActorHandle {
        id,
        name,
        interrupt,
        abort: task.abort_handle(),
        alive,
    };
    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MailboxRegistry;
    use std::time::Duration;

    #[tokio::test]
    async fn handle_tracks_liveness() {
        let id = MailboxRegistry::new().allocate();
        let (handle, task) = spawn_actor(id, "short", |_| async {});
        task.await.expect("actor task");
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn kill_aborts_and_raises_interrupt() {
        let id = MailboxRegistry::new().allocate();
        let (handle, task) = spawn_actor(id, "sleeper", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert!(handle.is_alive());

        handle.kill();
        let joined = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("task stops");
        assert!(joined.is_err_and(|e| e.is_cancelled()));
        assert!(!handle.is_alive());
        assert!(handle.interrupt().is_raised());

        // Killing twice is harmless.
        handle.kill();
    }
}
