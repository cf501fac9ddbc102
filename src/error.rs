use thiserror::Error;

/// Errors the orchestrator itself can raise.
///
/// Action/compensation failures are caught and wrapped by the engine; user
/// code never constructs `WorkflowFailed` or `CriticalStepFailed` directly.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Root failure kind: a step exhausted its retries (or failed once, if
    /// critical) and the workflow could not complete.
    #[error(
        "workflow '{workflow_name}' failed at step {step_number}: {cause} ({} compensation error(s))",
        compensation_errors.len()
    )]
    WorkflowFailed {
        workflow_name: String,
        step_number: usize,
        #[source]
        cause: anyhow::Error,
        compensation_errors: Vec<CompensationFailure>,
    },

    /// A step flagged `critical` raised an error. Propagation is immediate
    /// and unconditional, independent of retry exhaustion.
    #[error("critical step '{step_name}' failed: {cause}")]
    CriticalStepFailed {
        step_name: String,
        #[source]
        cause: anyhow::Error,
    },

    /// A timeout combinator, or a step's own configured timeout, elapsed.
    #[error("step '{step_name}' timed out")]
    StepTimedOut { step_name: String },

    /// The executing task or an awaited future was interrupted (cancelled)
    /// during a retry or compensation sleep.
    #[error("workflow interrupted during step '{step_name}'")]
    WorkflowInterrupted { step_name: String },

    /// A mutator was called while the engine was executing, or `execute()`
    /// was called on an engine that is not in a runnable state.
    #[error("invalid engine state: {0}")]
    InvalidState(String),
}

/// A single compensation's terminal failure, collected (never thrown
/// standalone) by the compensation engine.
#[derive(Debug, Error)]
#[error("compensation for step '{step_name}' failed: {cause}")]
pub struct CompensationFailure {
    pub step_name: String,
    #[source]
    pub cause: anyhow::Error,
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;
