use std::sync::mpsc::Sender;

use serde::Serialize;

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

/// Percent value carried by a failure event.
pub const FAILED: i32 = -1;

/// Percent value carried by the completion event.
pub const COMPLETE: i32 = 100;

/// Where in a run an event was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Emitted before file `current` is processed.
    Step,
    Completed,
    Failed,
}

/// One progress notification for a run.
///
/// Within a run the [`Stage::Step`] events climb `current` through 1..=total
/// without gaps, and the stream ends with exactly one event whose stage is
/// [`Stage::Completed`] (percent [`COMPLETE`]) or [`Stage::Failed`] (percent
/// [`FAILED`]). The last step of a successful run also reads 100%.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub percent: i32,
    pub row_id: u32,
    pub current: usize,
    pub total: usize,
    pub job_name: String,
}

impl ProgressEvent {
    /// Look-ahead progress for file `current` of `total`, emitted before the
    /// file is processed.
    pub fn step(row_id: u32, current: usize, total: usize, job_name: &str) -> Self {
        Self {
            stage: Stage::Step,
            percent: percent_of(current, total),
            row_id,
            current,
            total,
            job_name: job_name.to_string(),
        }
    }

    pub fn complete(row_id: u32, total: usize, job_name: &str) -> Self {
        Self {
            stage: Stage::Completed,
            percent: COMPLETE,
            row_id,
            current: total,
            total,
            job_name: job_name.to_string(),
        }
    }

    pub fn failed(row_id: u32, current: usize, total: usize, job_name: &str) -> Self {
        Self {
            stage: Stage::Failed,
            percent: FAILED,
            row_id,
            current,
            total,
            job_name: job_name.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage != Stage::Step
    }
}

/// `floor(current * 100 / total)`; zero for an empty run.
pub fn percent_of(current: usize, total: usize) -> i32 {
    if total == 0 {
        return 0;
    }
    (current * 100 / total) as i32
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Receives progress events from a run. Called on the worker thread, in order.
/// Implementations should return promptly; the worker holds the execution gate
/// while notifying.
pub trait Observer: Send + Sync {
    fn notify(&self, event: &ProgressEvent);
}

impl<F> Observer for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn notify(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Forwards events into a channel for a host event loop to drain.
#[derive(Debug)]
pub struct ChannelObserver {
    tx: std::sync::Mutex<Sender<ProgressEvent>>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self {
            tx: std::sync::Mutex::new(tx),
        }
    }
}

impl Observer for ChannelObserver {
    fn notify(&self, event: &ProgressEvent) {
        let Ok(tx) = self.tx.lock() else {
            return;
        };
        if tx.send(event.clone()).is_err() {
            log::debug!("progress receiver dropped; event for row {} discarded", event.row_id);
        }
    }
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn notify(&self, event: &ProgressEvent) {
        match event.stage {
            Stage::Failed => log::error!(
                "{} [row {}] failed at {} of {}",
                event.job_name,
                event.row_id,
                event.current,
                event.total
            ),
            _ => log::info!(
                "{} [row {}] {}% ({} of {})",
                event.job_name,
                event.row_id,
                event.percent,
                event.current,
                event.total
            ),
        }
    }
}
