//! Outcome of a step

use std::time::Duration;

use kube::runtime::controller::Action;

use crate::{Error, Result};

/// Delay used instead of an error when a write hit a resourceVersion conflict
pub const CONFLICT_REQUEUE: Duration = Duration::from_millis(100);

/// What the orchestrator should do after a step.
///
/// The three signals are independent: a step may proceed, ask for a delayed
/// requeue, or hand an error to the controller's backoff.
#[derive(Debug, Default)]
pub struct StepResult {
    proceed: bool,
    requeue_after: Option<Duration>,
    error: Option<Error>,
}

impl StepResult {
    /// Continue with the next step
    pub fn next() -> Self {
        Self {
            proceed: true,
            ..Default::default()
        }
    }

    /// Stop the cycle without requeueing
    pub fn stop() -> Self {
        Self::default()
    }

    /// Stop the cycle and requeue after `delay`
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
            ..Default::default()
        }
    }

    /// Stop the cycle with an error; conflicts become a short requeue
    pub fn from_error(error: Error) -> Self {
        if error.is_conflict() {
            return Self::requeue_after(CONFLICT_REQUEUE);
        }
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    /// Whether the orchestrator may run the next step
    pub fn should_proceed(&self) -> bool {
        self.proceed
    }

    /// Requested requeue delay
    pub fn requeue(&self) -> Option<Duration> {
        self.requeue_after
    }

    /// Error handed to the controller
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Convert into the controller's reconcile outcome
    pub fn into_action(self) -> Result<Action> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(match self.requeue_after {
            Some(delay) => Action::requeue(delay),
            None => Action::await_change(),
        })
    }
}
