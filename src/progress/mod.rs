//! Task progress reporting
//!
//! A [`ProgressSink`] delivers events to whoever observes a task. Pipeline
//! code talks to a [`TaskProgress`], which enforces the per-task ordering
//! contract: percentages never go backwards and nothing is published after
//! a terminal event.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

pub mod hub;
pub use hub::{ProgressHub, Subscription};

/// Progress value of a successfully completed task
pub const PROGRESS_COMPLETE: i32 = 100;
/// Progress value of a task that failed
pub const PROGRESS_FAILED: i32 = -1;

/// One progress notification as sent to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub progress: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl ProgressEvent {
    pub fn new(progress: i32, message: impl Into<String>) -> Self {
        Self {
            progress,
            message: message.into(),
            detail: None,
            download_url: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = Some(url.into());
        self
    }

    /// Completion or failure; observers can stop listening after this
    pub fn is_terminal(&self) -> bool {
        self.progress == PROGRESS_COMPLETE || self.progress == PROGRESS_FAILED
    }
}

/// Best-effort delivery of progress events; an unobserved task is not an error
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, task_id: &str, event: ProgressEvent);
}

pub struct NoOpProgress;

#[async_trait]
impl ProgressSink for NoOpProgress {
    async fn publish(&self, _task_id: &str, _event: ProgressEvent) {}
}

/// Writes progress to the log; used by the one-shot CLI run
pub struct LogProgress;

#[async_trait]
impl ProgressSink for LogProgress {
    async fn publish(&self, task_id: &str, event: ProgressEvent) {
        match &event.detail {
            Some(detail) => info!(
                "Task {} [{}%] {} ({})",
                task_id, event.progress, event.message, detail
            ),
            None => info!("Task {} [{}%] {}", task_id, event.progress, event.message),
        }
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    percent: i32,
    finished: bool,
}

/// Progress reporter bound to one task
pub struct TaskProgress {
    task_id: String,
    sink: Arc<dyn ProgressSink>,
    state: Mutex<ProgressState>,
}

impl TaskProgress {
    pub fn new(task_id: impl Into<String>, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            task_id: task_id.into(),
            sink,
            state: Mutex::new(ProgressState::default()),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Publish a status message at `percent` (raised to the last value if lower)
    pub async fn update(&self, percent: i32, message: impl Into<String>) {
        self.emit(ProgressEvent::new(percent, message)).await;
    }

    /// Publish a status message with a per-row detail line
    pub async fn update_with_detail(
        &self,
        percent: i32,
        message: impl Into<String>,
        detail: impl Into<String>,
    ) {
        self.emit(ProgressEvent::new(percent, message).with_detail(detail))
            .await;
    }

    /// Terminal success event
    pub async fn complete(&self, message: impl Into<String>, download_url: Option<String>) {
        let mut event = ProgressEvent::new(PROGRESS_COMPLETE, message);
        event.download_url = download_url;
        self.emit(event).await;
    }

    /// Terminal failure event
    pub async fn fail(&self, message: impl Into<String>) {
        self.emit(ProgressEvent::new(PROGRESS_FAILED, message)).await;
    }

    async fn emit(&self, mut event: ProgressEvent) {
        {
            let mut state = self.lock();
            if state.finished {
                debug!(
                    "Dropping progress event for finished task {}: {}",
                    self.task_id, event.message
                );
                return;
            }
            if event.progress == PROGRESS_FAILED {
                state.finished = true;
            } else {
                event.progress = event.progress.clamp(state.percent, PROGRESS_COMPLETE);
                state.percent = event.progress;
                state.finished = event.progress == PROGRESS_COMPLETE;
            }
        }
        self.sink.publish(&self.task_id, event).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Maps rows processed within one stage onto its slice of overall progress
pub struct StageMeter<'a> {
    progress: &'a TaskProgress,
    start: i32,
    end: i32,
    total: usize,
    message: String,
}

impl<'a> StageMeter<'a> {
    pub fn new(
        progress: &'a TaskProgress,
        start: i32,
        end: i32,
        total: usize,
        message: impl Into<String>,
    ) -> Self {
        Self {
            progress,
            start,
            end: end.max(start),
            total,
            message: message.into(),
        }
    }

    /// Announce the stage at its starting percentage
    pub async fn begin(&self) {
        self.progress.update(self.start, self.message.clone()).await;
    }

    /// Report that the row at `index` (0-based) has been handled
    pub async fn row_done(&self, index: usize) {
        let done = index + 1;
        self.progress
            .update_with_detail(
                self.percent_after(done),
                self.message.clone(),
                format!("Processed {} of {}", done, self.total),
            )
            .await;
    }

    /// Percentage once `done` rows are finished (pure)
    pub fn percent_after(&self, done: usize) -> i32 {
        if self.total == 0 {
            return self.end;
        }
        let span = i64::from(self.end - self.start);
        let done = done.min(self.total) as i64;
        let offset = done * span / self.total as i64;
        self.start + offset as i32
    }
}
