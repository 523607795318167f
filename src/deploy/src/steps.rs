/// Step runner: executes a fixed, ordered list of named steps with progress
/// reporting. Fail-fast: the first failing step stops the sequence.
use crate::error::{DeployError, Result};
use crate::progress::{ProgressReporter, StepEvent, StepState};
use std::future::Future;
use std::sync::Arc;

/// A named step. Carries no status so one list can be reused across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStep {
    pub index: usize,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Run state owned by a single runner.
#[derive(Debug, Clone, Default)]
pub struct StepRunState {
    pub current_index: usize,
    pub results: Vec<(DeploymentStep, StepOutcome)>,
}

impl StepRunState {
    pub fn failed_step(&self) -> Option<&DeploymentStep> {
        self.results
            .iter()
            .find(|(_, outcome)| matches!(outcome, StepOutcome::Failed(_)))
            .map(|(step, _)| step)
    }
}

pub struct StepRunner {
    phase: String,
    steps: Vec<DeploymentStep>,
    state: StepRunState,
    running: Option<usize>,
    completed: bool,
    reporter: Arc<dyn ProgressReporter>,
}

impl StepRunner {
    pub fn new<S: AsRef<str>>(
        phase: impl Into<String>,
        names: &[S],
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        let steps = names
            .iter()
            .enumerate()
            .map(|(index, name)| DeploymentStep {
                index,
                name: name.as_ref().to_string(),
            })
            .collect();

        Self {
            phase: phase.into(),
            steps,
            state: StepRunState::default(),
            running: None,
            completed: false,
            reporter,
        }
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn steps(&self) -> &[DeploymentStep] {
        &self.steps
    }

    pub fn state(&self) -> &StepRunState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.failed_step().is_some() || self.state.results.len() == self.steps.len()
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn status(&self, name: &str) -> Option<StepStatus> {
        let step = self.steps.iter().find(|s| s.name == name)?;
        if self.running == Some(step.index) {
            return Some(StepStatus::Running);
        }
        let status = match self.state.results.iter().find(|(s, _)| s.index == step.index) {
            Some((_, StepOutcome::Succeeded)) => StepStatus::Succeeded,
            Some((_, StepOutcome::Failed(_))) => StepStatus::Failed,
            None => StepStatus::Pending,
        };
        Some(status)
    }

    /// Run the step called `name`.
    ///
    /// The step must be the next one in declaration order. A failure is
    /// recorded, reported and returned unchanged.
    pub async fn run_step<T, F, Fut>(&mut self, name: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let step = self
            .steps
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| DeployError::UnknownStep(name.to_string()))?;

        if self.state.failed_step().is_some() {
            return Err(DeployError::StepAborted(step.name));
        }

        if step.index != self.state.current_index {
            let expected = self
                .steps
                .get(self.state.current_index)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| "<none>".to_string());
            return Err(DeployError::StepOrder {
                requested: step.name,
                expected,
            });
        }

        self.running = Some(step.index);
        self.report(&step, StepState::Started);
        tracing::info!(
            "[StepRunner] {} ({}/{}): {}",
            self.phase,
            step.index + 1,
            self.steps.len(),
            step.name
        );

        let step_start = std::time::Instant::now();
        let result = operation().await;
        let step_duration = step_start.elapsed();
        self.running = None;

        match result {
            Ok(value) => {
                tracing::info!(
                    "[TIMING] Step {} completed in {}ms",
                    step.name,
                    step_duration.as_millis()
                );
                self.state.current_index += 1;
                self.state
                    .results
                    .push((step.clone(), StepOutcome::Succeeded));
                self.report(&step, StepState::Completed);
                Ok(value)
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(
                    "[TIMING] Step {} failed after {}ms: {}",
                    step.name,
                    step_duration.as_millis(),
                    message
                );
                self.state
                    .results
                    .push((step.clone(), StepOutcome::Failed(message.clone())));
                self.report(&step, StepState::Failed(message));
                Err(e)
            }
        }
    }

    /// Mark the whole sequence done for display purposes.
    pub fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.reporter.finish(&self.phase);
    }

    fn report(&self, step: &DeploymentStep, state: StepState) {
        self.reporter.emit(StepEvent {
            step_index: step.index,
            step_name: step.name.clone(),
            state,
            phase: Some(self.phase.clone()),
            total_steps: self.steps.len(),
        });
    }
}
