//! Progress events emitted by the step runner and the reporters that carry them
//! to a display.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// State reported for a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "lowercase")]
pub enum StepState {
    Started,
    Completed,
    Failed(String),
}

/// One progress event: `(step_index, step_name, state)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEvent {
    pub step_index: usize,
    pub step_name: String,
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub total_steps: usize,
}

impl StepEvent {
    pub fn new(step_index: usize, step_name: impl Into<String>, state: StepState) -> Self {
        Self {
            step_index,
            step_name: step_name.into(),
            state,
            phase: None,
            total_steps: 0,
        }
    }

    pub fn as_tuple(&self) -> (usize, &str, &StepState) {
        (self.step_index, &self.step_name, &self.state)
    }
}

/// Receives step events from a runner.
pub trait ProgressReporter: Send + Sync + 'static {
    fn emit(&self, event: StepEvent);

    /// Called once a whole step sequence has finished successfully.
    fn finish(&self, _phase: &str) {}
}

/// Channel-based progress reporter.
///
/// The channel is unbounded: a slow display never blocks the pipeline and no
/// event is lost, `Failed` included. Sends after the receiver is gone are
/// ignored.
pub struct ChannelProgressReporter {
    sender: tokio::sync::mpsc::UnboundedSender<ProgressMessage>,
}

/// What a [`ChannelProgressReporter`] puts on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressMessage {
    Step(StepEvent),
    Finished(String),
}

impl ChannelProgressReporter {
    pub fn new(sender: tokio::sync::mpsc::UnboundedSender<ProgressMessage>) -> Self {
        Self { sender }
    }
}

impl ProgressReporter for ChannelProgressReporter {
    fn emit(&self, event: StepEvent) {
        let _ = self.sender.send(ProgressMessage::Step(event));
    }

    fn finish(&self, phase: &str) {
        let _ = self.sender.send(ProgressMessage::Finished(phase.to_string()));
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<StepEvent>>,
    finished: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StepEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Events as `(index, name, state)` tuples.
    pub fn tuples(&self) -> Vec<(usize, String, StepState)> {
        self.events()
            .into_iter()
            .map(|e| (e.step_index, e.step_name, e.state))
            .collect()
    }

    pub fn finished_phases(&self) -> Vec<String> {
        self.finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ProgressReporter for RecordingReporter {
    fn emit(&self, event: StepEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    fn finish(&self, phase: &str) {
        self.finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(phase.to_string());
    }
}

/// Reporter that only logs.
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn emit(&self, event: StepEvent) {
        let phase = event.phase.as_deref().unwrap_or("-");
        match &event.state {
            StepState::Started => tracing::info!(
                "[{}] ({}/{}) {} started",
                phase,
                event.step_index + 1,
                event.total_steps,
                event.step_name
            ),
            StepState::Completed => tracing::info!(
                "[{}] ({}/{}) {} completed",
                phase,
                event.step_index + 1,
                event.total_steps,
                event.step_name
            ),
            StepState::Failed(error) => tracing::error!(
                "[{}] ({}/{}) {} failed: {}",
                phase,
                event.step_index + 1,
                event.total_steps,
                event.step_name,
                error
            ),
        }
    }

    fn finish(&self, phase: &str) {
        tracing::info!("[{}] all steps completed", phase);
    }
}
