use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::context::Context;
use crate::observability::MetricsCollector;
use crate::step::Step;

/// The three ways a single step's attempt loop can end without a value,
/// distinguished because the engine reacts to each differently: a
/// critical-step wrap, a `StepTimedOut`, or a `WorkflowInterrupted`.
#[derive(Debug)]
pub enum StepFailure {
    Action(anyhow::Error),
    TimedOut,
    Interrupted,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFailure::Action(e) => write!(f, "{e}"),
            StepFailure::TimedOut => write!(f, "step timed out"),
            StepFailure::Interrupted => write!(f, "step interrupted"),
        }
    }
}

impl std::error::Error for StepFailure {}

/// Runs a single step (sync or async) to completion, applying its own
/// retry policy and per-step timeout. Pluggable so callers can override
/// the retry/backoff behaviour entirely via an optional step executor
/// override on the engine; [`DefaultStepExecutor`] implements the
/// orchestrator's default retry policy.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        step: &Step,
        context: &Arc<Context>,
        metrics: Option<&Arc<dyn MetricsCollector>>,
    ) -> Result<Value, StepFailure>;
}

/// The orchestrator's default retry loop: attempt counter starts at 1;
/// on failure, report the attempt to the metrics collector, then retry
/// unless `attempt > max_retries` or the caller declared the error
/// non-retryable, sleeping `retry_delay` between attempts.
#[derive(Default)]
pub struct DefaultStepExecutor;

impl DefaultStepExecutor {
    pub fn new() -> Self {
        Self
    }

    async fn run_once(
        &self,
        step: &Step,
        context: &Arc<Context>,
        timeout: Option<Duration>,
    ) -> Result<Value, StepFailure> {
        match step {
            Step::Sync(sync_step) => {
                let action = sync_step.action.clone();
                let handle = tokio::task::spawn_blocking(move || action());
                let joined = match timeout {
                    Some(duration) => match tokio::time::timeout(duration, handle).await {
                        Ok(joined) => joined,
                        Err(_) => return Err(StepFailure::TimedOut),
                    },
                    None => handle.await,
                };
                match joined {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(StepFailure::Action(e)),
                    Err(join_err) if join_err.is_cancelled() => Err(StepFailure::Interrupted),
                    Err(join_err) => Err(StepFailure::Action(anyhow::anyhow!(
                        "step '{}' panicked: {join_err}",
                        step.name()
                    ))),
                }
            }
            Step::Async(async_step) => {
                let fut = (async_step.action)(context.clone());
                match timeout {
                    Some(duration) => match tokio::time::timeout(duration, fut).await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(StepFailure::Action(e)),
                        Err(_) => Err(StepFailure::TimedOut),
                    },
                    None => match fut.await {
                        Ok(value) => Ok(value),
                        Err(e) => Err(StepFailure::Action(e)),
                    },
                }
            }
            Step::Control(_) => unreachable!(
                "control steps are driven by the engine, never by StepExecutor::execute"
            ),
        }
    }
}

#[async_trait]
impl StepExecutor for DefaultStepExecutor {
    async fn execute(
        &self,
        step: &Step,
        context: &Arc<Context>,
        metrics: Option<&Arc<dyn MetricsCollector>>,
    ) -> Result<Value, StepFailure> {
        let config = step.config();
        let name = step.name().to_string();
        let mut attempt: u32 = 1;

        loop {
            let start = Instant::now();
            let outcome = self.run_once(step, context, config.timeout).await;
            let duration = start.elapsed();

            match outcome {
                Ok(value) => {
                    if let Some(metrics) = metrics {
                        metrics.record_step_execution(&name, duration, true).await;
                    }
                    return Ok(value);
                }
                Err(failure) => {
                    if let Some(metrics) = metrics {
                        metrics.record_step_execution(&name, duration, false).await;
                        metrics.record_retry(&name, attempt).await;
                    }

                    if matches!(failure, StepFailure::Interrupted) {
                        return Err(failure);
                    }

                    if let StepFailure::Action(ref e) = failure {
                        if let Some(predicate) = &config.non_retryable {
                            if predicate(e) {
                                warn!(step_name = %name, "error declared non-retryable, not retrying");
                                return Err(failure);
                            }
                        }
                    }

                    if attempt > config.max_retries {
                        return Err(failure);
                    }

                    warn!(step_name = %name, attempt, error = %failure, "step attempt failed, retrying");
                    attempt += 1;
                    if !config.retry_delay.is_zero() {
                        tokio::time::sleep(config.retry_delay).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::SyncStepBuilder;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_retry() {
        let step = Step::Sync(
            SyncStepBuilder::new("s", || Ok(42_i32))
                .with_max_retries(3)
                .build(),
        );
        let ctx = Arc::new(Context::new());
        let executor = DefaultStepExecutor::new();
        let value = executor.execute(&step, &ctx, None).await.unwrap();
        assert_eq!(value, Value::from(42));
    }

    #[tokio::test]
    async fn retries_max_retries_plus_one_times_then_fails() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let step = Step::Sync(
            SyncStepBuilder::new("s", move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(anyhow::anyhow!("boom"))
            })
            .with_max_retries(3)
            .with_retry_delay(StdDuration::ZERO)
            .build(),
        );
        let ctx = Arc::new(Context::new());
        let executor = DefaultStepExecutor::new();
        let result = executor.execute(&step, &ctx, None).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_retryable_predicate_short_circuits_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let step = Step::Sync(
            SyncStepBuilder::new("s", move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(anyhow::anyhow!("fatal"))
            })
            .with_max_retries(5)
            .with_retry_delay(StdDuration::ZERO)
            .non_retryable_if(|e| e.to_string().contains("fatal"))
            .build(),
        );
        let ctx = Arc::new(Context::new());
        let executor = DefaultStepExecutor::new();
        let result = executor.execute(&step, &ctx, None).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_shorter_than_action_is_reported_as_timed_out() {
        let step = Step::Async(crate::step::AsyncStepBuilder::new("slow", |_ctx| async {
            tokio::time::sleep(StdDuration::from_millis(200)).await;
            Ok::<_, anyhow::Error>(1_i32)
        })
        .with_max_retries(0)
        .with_timeout(StdDuration::from_millis(10))
        .build());
        let ctx = Arc::new(Context::new());
        let executor = DefaultStepExecutor::new();
        let result = executor.execute(&step, &ctx, None).await;
        assert!(matches!(result, Err(StepFailure::TimedOut)));
    }
}
