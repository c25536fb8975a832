//! Per-task progress channels
//!
//! At most one observer per task. A new subscription replaces the previous
//! one. The latest event of every task is retained and replayed to whoever
//! subscribes next, so an observer that attaches after a task has already
//! failed or finished still receives the terminal event.

use super::{ProgressEvent, ProgressSink};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Receiving half handed to an observer
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::UnboundedReceiver<ProgressEvent>,
}

#[derive(Default)]
struct Channels {
    observers: HashMap<String, (u64, mpsc::UnboundedSender<ProgressEvent>)>,
    latest: HashMap<String, ProgressEvent>,
}

#[derive(Default)]
pub struct ProgressHub {
    channels: RwLock<Channels>,
    next_id: AtomicU64,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an observer to a task, replacing any existing one
    ///
    /// The task's latest event, if any, is queued on the new receiver first.
    pub fn subscribe(&self, task_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(event) = channels.latest.get(task_id) {
            debug!(
                "Replaying progress {} to new observer of task {}",
                event.progress, task_id
            );
            let _ = sender.send(event.clone());
        }
        if channels
            .observers
            .insert(task_id.to_string(), (id, sender))
            .is_some()
        {
            debug!("Replaced progress observer for task {}", task_id);
        }

        Subscription { id, receiver }
    }

    /// Detach an observer; a newer subscription for the same task is left alone
    ///
    /// A retained terminal event is forgotten once its observer leaves.
    pub fn unsubscribe(&self, task_id: &str, id: u64) {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if channels
            .observers
            .get(task_id)
            .is_some_and(|(current, _)| *current == id)
        {
            channels.observers.remove(task_id);
            if channels
                .latest
                .get(task_id)
                .is_some_and(ProgressEvent::is_terminal)
            {
                channels.latest.remove(task_id);
            }
            debug!("Progress observer detached from task {}", task_id);
        }
    }

    pub fn is_observed(&self, task_id: &str) -> bool {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .observers
            .contains_key(task_id)
    }
}

#[async_trait]
impl ProgressSink for ProgressHub {
    async fn publish(&self, task_id: &str, event: ProgressEvent) {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match channels.observers.get(task_id) {
            Some((_, sender)) => {
                if sender.send(event.clone()).is_err() {
                    trace!("Observer of task {} is gone", task_id);
                }
            }
            None => trace!("No observer for task {}", task_id),
        }
        channels.latest.insert(task_id.to_string(), event);
    }
}
