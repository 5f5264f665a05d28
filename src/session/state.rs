//! Shared per-session tables, each behind one short-lived lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::mailbox::ActorId;
use crate::protocol::Sexp;

/// Actors currently running a client-issued evaluation.
#[derive(Debug, Default)]
pub struct ActiveEvaluations(Mutex<BTreeSet<ActorId>>);

impl ActiveEvaluations {
    pub fn add(&self, actor: ActorId) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).insert(actor);
    }

    pub fn remove(&self, actor: ActorId) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).remove(&actor);
    }

    pub fn contains(&self, actor: ActorId) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).contains(&actor)
    }

    /// Oldest active actor.
    #[cfg(test)]
    pub(crate) fn first(&self) -> Option<ActorId> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .copied()
    }

    /// Oldest active actor accepted by `live`.
    pub fn first_where(&self, live: impl Fn(ActorId) -> bool) -> Option<ActorId> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .find(|actor| live(*actor))
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<ActorId> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }
}

/// Client answer to an input prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadAnswer {
    Text(String),
    Value(Sexp),
}

#[derive(Debug)]
struct Waiting {
    actor: ActorId,
    reply: oneshot::Sender<ReadAnswer>,
}

/// Input prompts waiting for the client, keyed by tag.
///
/// Dropping an entry's sender wakes the waiting actor with an abort.
#[derive(Debug, Default)]
pub struct PendingReads {
    last_tag: AtomicU64,
    waiting: Mutex<HashMap<u64, Waiting>>,
}

impl PendingReads {
    pub fn register(&self, actor: ActorId) -> (u64, oneshot::Receiver<ReadAnswer>) {
        let tag = self.last_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let (reply, rx) = oneshot::channel();
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag, Waiting { actor, reply });
        (tag, rx)
    }

    /// Deliver an answer. False if nobody waits on `tag` any more.
    pub fn resolve(&self, tag: u64, answer: ReadAnswer) -> bool {
        let waiting = self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tag);
        match waiting {
            Some(waiting) => waiting.reply.send(answer).is_ok(),
            None => false,
        }
    }

    /// Abort every prompt owned by `actor`; returns how many were dropped.
    pub fn abort_actor(&self, actor: ActorId) -> usize {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        let before = waiting.len();
        waiting.retain(|_, entry| entry.actor != actor);
        before - waiting.len()
    }

    pub fn abort_all(&self) {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Indentation hints already sent to the client.
#[derive(Debug, Default)]
pub struct IndentationCache(Mutex<HashMap<String, i64>>);

impl IndentationCache {
    /// Record `hints` and return the entries that are new or changed.
    pub fn update(&self, hints: Vec<(String, i64)>) -> Vec<(String, i64)> {
        let mut cache = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delta: Vec<(String, i64)> = hints
            .into_iter()
            .filter(|(name, indent)| cache.get(name) != Some(indent))
            .collect();
        for (name, indent) in &delta {
            cache.insert(name.clone(), *indent);
        }
        delta.sort();
        delta
    }
}
