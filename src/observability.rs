use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

/// Per-step lifecycle hook. All methods are invoked synchronously (i.e.
/// awaited in order) by the engine around every step; a default no-op
/// body means callers only implement what they need.
#[async_trait]
pub trait StepInterceptor: Send + Sync {
    async fn before_step(&self, step_name: &str) {
        let _ = step_name;
    }

    async fn after_step(&self, step_name: &str, result: &Value) {
        let _ = (step_name, result);
    }

    async fn on_step_error(&self, step_name: &str, error: &str) {
        let _ = (step_name, error);
    }
}

/// Per-workflow lifecycle hook.
#[async_trait]
pub trait WorkflowListener: Send + Sync {
    async fn on_workflow_start(&self, workflow_name: &str) {
        let _ = workflow_name;
    }

    async fn on_workflow_complete(&self, workflow_name: &str, result: &Value) {
        let _ = (workflow_name, result);
    }

    async fn on_workflow_error(&self, workflow_name: &str, error: &str) {
        let _ = (workflow_name, error);
    }

    async fn on_compensation_start(&self, workflow_name: &str, step_count: usize) {
        let _ = (workflow_name, step_count);
    }

    async fn on_compensation_complete(&self, workflow_name: &str, succeeded: usize, failed: usize) {
        let _ = (workflow_name, succeeded, failed);
    }
}

/// Collects step/compensation execution metrics. Implementations are
/// expected to be cheap and non-blocking (they run inline on the
/// executing task).
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    async fn record_step_execution(&self, step_name: &str, duration: std::time::Duration, success: bool) {
        let _ = (step_name, duration, success);
    }

    async fn record_retry(&self, step_name: &str, attempt: u32) {
        let _ = (step_name, attempt);
    }

    async fn record_compensation(&self, step_name: &str, success: bool) {
        let _ = (step_name, success);
    }
}

/// Lifecycle hooks are defensively wrapped: any failure inside a hook is
/// logged and swallowed, never propagated. Since the traits above return
/// `()` rather than `Result`, the only failure mode left to guard is a
/// panic; `catch_unwind` cannot cross an `async` boundary, so hook bodies
/// are expected to be infallible by construction (no `Result`-returning
/// hook signature is exposed). Hooks that need to report an internal
/// problem should log it themselves and return normally.
pub fn log_hook_registered(hook_kind: &str) {
    tracing::debug!(hook_kind, "registered lifecycle hook");
}

/// A `StepInterceptor` that emits `tracing` events; used as a sane
/// default when a caller wants visibility without writing their own hook.
pub struct TracingStepInterceptor;

#[async_trait]
impl StepInterceptor for TracingStepInterceptor {
    async fn before_step(&self, step_name: &str) {
        tracing::info!(step_name, "before step");
    }

    async fn after_step(&self, step_name: &str, result: &Value) {
        tracing::info!(step_name, ?result, "after step");
    }

    async fn on_step_error(&self, step_name: &str, error: &str) {
        warn!(step_name, error, "step error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingInterceptor {
        before: Arc<AtomicUsize>,
        after: Arc<AtomicUsize>,
        error: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StepInterceptor for CountingInterceptor {
        async fn before_step(&self, _step_name: &str) {
            self.before.fetch_add(1, Ordering::SeqCst);
        }
        async fn after_step(&self, _step_name: &str, _result: &Value) {
            self.after.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_step_error(&self, _step_name: &str, _error: &str) {
            self.error.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn interceptor_hooks_are_invoked() {
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let error = Arc::new(AtomicUsize::new(0));
        let interceptor = CountingInterceptor {
            before: before.clone(),
            after: after.clone(),
            error: error.clone(),
        };

        interceptor.before_step("s1").await;
        interceptor.after_step("s1", &Value::Null).await;
        interceptor.on_step_error("s1", "boom").await;

        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(error.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn default_hook_bodies_are_no_ops() {
        struct Empty;
        #[async_trait]
        impl StepInterceptor for Empty {}
        #[async_trait]
        impl WorkflowListener for Empty {}
        #[async_trait]
        impl MetricsCollector for Empty {}

        let empty = Empty;
        empty.before_step("s").await;
        empty.on_workflow_start("wf").await;
        empty.record_retry("s", 1).await;
    }
}
