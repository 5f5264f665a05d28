//! Per-actor mailboxes, the only channel between a session's actors.
//!
//! Mailboxes are created lazily on first reference and never removed. Actors
//! are long-lived and the entries are small, so the registry grows with the
//! number of actors ever started in the process.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::protocol::{ClientEvent, DebugKind, ReturnStatus, ServerEvent, Sexp};

/// Identity of one logical actor (reader, control, REPL or worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(u64);

impl ActorId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    /// Start signal for the reader pump.
    Begin,
    /// Decoded client message, reader to control.
    Client(ClientEvent),
    /// Work item, control to an evaluation actor.
    Evaluate {
        form: Sexp,
        namespace: String,
        id: i64,
    },
    /// Finished evaluation, evaluation actor to control.
    EvaluationResult {
        actor: ActorId,
        status: ReturnStatus,
        id: i64,
    },
    /// Debugger event; control replaces the actor with its display name.
    Debug {
        actor: ActorId,
        kind: DebugKind,
        rest: Vec<Sexp>,
    },
    /// Event written to the wire unchanged.
    Emit(ServerEvent),
}

/// Unbounded FIFO queue owned by a single actor.
#[derive(Debug)]
pub struct Mailbox {
    tx: UnboundedSender<Message>,
    rx: tokio::sync::Mutex<UnboundedReceiver<Message>>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Never blocks.
    pub fn send(&self, msg: Message) {
        // The receiver lives as long as `self`, so the channel cannot be closed.
        let _ = self.tx.send(msg);
    }

    /// Wait for the next message. Only the owning actor calls this.
    pub async fn receive(&self) -> Message {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(msg) => msg,
            None => std::future::pending().await,
        }
    }
}

#[derive(Debug, Default)]
pub struct MailboxRegistry {
    last_actor: AtomicU64,
    mailboxes: Mutex<HashMap<ActorId, Arc<Mailbox>>>,
}

impl MailboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a process-unique actor identity.
    pub fn allocate(&self) -> ActorId {
        ActorId(self.last_actor.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Get or create the mailbox for `actor`. Concurrent first calls for the
    /// same actor all observe one mailbox.
    pub fn mailbox_for(&self, actor: ActorId) -> Arc<Mailbox> {
        let mut mailboxes = self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            mailboxes
                .entry(actor)
                .or_insert_with(|| Arc::new(Mailbox::new())),
        )
    }

    pub fn send(&self, actor: ActorId, msg: Message) {
        self.mailbox_for(actor).send(msg);
    }

    pub async fn receive(&self, actor: ActorId) -> Message {
        let mailbox = self.mailbox_for(actor);
        mailbox.receive().await
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.mailboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn emit(text: &str) -> Message {
        Message::Emit(ServerEvent::write_string(text))
    }

    fn text_of(msg: Message) -> String {
        match msg {
            Message::Emit(ServerEvent::WriteString { text, .. }) => text,
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn concurrent_first_lookup_creates_one_mailbox() {
        let registry = Arc::new(MailboxRegistry::new());
        let actor = registry.allocate();
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.mailbox_for(actor)
                })
            })
            .collect();
        let mailboxes: Vec<Arc<Mailbox>> = handles
            .into_iter()
            .map(|h| h.join().expect("lookup thread"))
            .collect();

        assert!(mailboxes.iter().all(|m| Arc::ptr_eq(m, &mailboxes[0])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn actor_ids_are_unique() {
        let registry = MailboxRegistry::new();
        let a = registry.allocate();
        let b = registry.allocate();
        assert_ne!(a, b);
        assert!(!Arc::ptr_eq(&registry.mailbox_for(a), &registry.mailbox_for(b)));
    }

    #[tokio::test]
    async fn delivery_is_fifo() {
        let registry = MailboxRegistry::new();
        let actor = registry.allocate();
        for text in ["one", "two", "three"] {
            registry.send(actor, emit(text));
        }
        for expected in ["one", "two", "three"] {
            assert_eq!(text_of(registry.receive(actor).await), expected);
        }
    }

    #[tokio::test]
    async fn receive_waits_for_a_message() {
        let registry = Arc::new(MailboxRegistry::new());
        let actor = registry.allocate();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.receive(actor).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        registry.send(actor, emit("late"));
        let msg = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("receive completes")
            .expect("receiver task");
        assert_eq!(text_of(msg), "late");
    }
}
