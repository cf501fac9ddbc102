use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::context::Context;
use crate::defaults::{DEFAULT_COMPENSATION_TIMEOUT, DEFAULT_MAX_COMPENSATION_RETRIES, DEFAULT_RETRY_DELAY};
use crate::error::CompensationFailure;
use crate::observability::{MetricsCollector, WorkflowListener};
use crate::step::Step;

/// Outcome of a full reverse-order compensation sweep: how many of the
/// executed steps' compensations ran successfully, how many exhausted
/// their retries, and the collected failures. These are never thrown
/// standalone; they ride inside the workflow's final error.
pub struct CompensationReport {
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<CompensationFailure>,
}

/// Drives the reverse-order compensation sweep over a workflow's
/// executed steps. Steps without a compensation are counted but skipped
/// silently; a step whose compensation fails after retries is recorded
/// in `errors` and the sweep continues.
pub struct CompensationEngine {
    metrics: Option<Arc<dyn MetricsCollector>>,
    listeners: Vec<Arc<dyn WorkflowListener>>,
}

impl CompensationEngine {
    pub fn new(
        metrics: Option<Arc<dyn MetricsCollector>>,
        listeners: Vec<Arc<dyn WorkflowListener>>,
    ) -> Self {
        Self { metrics, listeners }
    }

    /// Iterates `executed` in strict reverse order. `context` supplies
    /// each step's previously recorded result, passed to its compensation
    /// by value rather than via a fresh context lookup, keeping ownership
    /// one-directional between engine, steps and compensations.
    pub async fn compensate(
        &self,
        workflow_name: &str,
        executed: &[Step],
        context: &Arc<Context>,
    ) -> CompensationReport {
        for listener in &self.listeners {
            listener
                .on_compensation_start(workflow_name, executed.len())
                .await;
        }
        info!(
            workflow_name,
            step_count = executed.len(),
            "starting compensation sweep"
        );

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut errors = Vec::new();

        for step in executed.iter().rev() {
            if !step.has_compensation() {
                continue;
            }

            let value = context.step_result(step.id()).await.unwrap_or(Value::Null);
            match self.compensate_one(step, value).await {
                Ok(()) => {
                    succeeded += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_compensation(step.name(), true).await;
                    }
                    info!(step_name = step.name(), "compensation succeeded");
                }
                Err(cause) => {
                    failed += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_compensation(step.name(), false).await;
                    }
                    warn!(step_name = step.name(), error = %cause, "compensation failed, continuing sweep");
                    errors.push(CompensationFailure {
                        step_name: step.name().to_string(),
                        cause,
                    });
                }
            }
        }

        for listener in &self.listeners {
            listener
                .on_compensation_complete(workflow_name, succeeded, failed)
                .await;
        }

        CompensationReport {
            succeeded,
            failed,
            errors,
        }
    }

    /// Invokes one step's compensation with up to
    /// `DEFAULT_MAX_COMPENSATION_RETRIES` retries, sleeping
    /// `DEFAULT_RETRY_DELAY` between attempts. Async compensations are
    /// additionally bounded per-attempt by `DEFAULT_COMPENSATION_TIMEOUT`:
    /// they are awaited, not fired-and-forgotten.
    async fn compensate_one(&self, step: &Step, value: Value) -> anyhow::Result<()> {
        let mut attempt: u32 = 1;
        loop {
            let outcome = self.invoke(step, value.clone()).await;
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if attempt > DEFAULT_MAX_COMPENSATION_RETRIES {
                        return Err(e);
                    }
                    warn!(
                        step_name = step.name(),
                        attempt,
                        error = %e,
                        "compensation attempt failed, retrying"
                    );
                    attempt += 1;
                    if !DEFAULT_RETRY_DELAY.is_zero() {
                        tokio::time::sleep(DEFAULT_RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    async fn invoke(&self, step: &Step, value: Value) -> anyhow::Result<()> {
        match step {
            Step::Sync(s) => {
                let Some(compensation) = s.compensation.clone() else {
                    return Ok(());
                };
                let handle = tokio::task::spawn_blocking(move || compensation(value));
                match handle.await {
                    Ok(result) => result,
                    Err(join_err) if join_err.is_cancelled() => {
                        Err(anyhow::anyhow!("compensation for '{}' was interrupted", step.name()))
                    }
                    Err(join_err) => Err(anyhow::anyhow!(
                        "compensation for '{}' panicked: {join_err}",
                        step.name()
                    )),
                }
            }
            Step::Async(s) => {
                let Some(compensation) = s.compensation.clone() else {
                    return Ok(());
                };
                let fut = compensation(value);
                match tokio::time::timeout(DEFAULT_COMPENSATION_TIMEOUT, fut).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(step_name = step.name(), "async compensation timed out, proceeding");
                        Err(anyhow::anyhow!("compensation for '{}' timed out", step.name()))
                    }
                }
            }
            Step::Control(_) => Ok(()),
        }
    }
}
