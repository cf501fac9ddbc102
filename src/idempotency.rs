use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// External collaborator that tells the engine whether a given
/// `(workflow_id, step_id)` pair has already run. Must be safe for
/// concurrent use — this codebase's equivalent of `k1s0-idempotency`'s
/// `IdempotencyStore`, shaped for workflow steps rather than HTTP
/// requests.
#[async_trait]
pub trait IdempotencyChecker: Send + Sync {
    async fn is_step_executed(&self, workflow_id: &str, step_id: &str) -> bool;
    async fn mark_step_executed(&self, workflow_id: &str, step_id: &str);
}

/// In-memory `IdempotencyChecker`, the default an engine falls back to
/// when constructed without one. Not durable across process restarts —
/// consistent with the orchestrator's single-process, in-memory scope.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyChecker {
    seen: Arc<RwLock<HashSet<(String, String)>>>,
}

impl InMemoryIdempotencyChecker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyChecker for InMemoryIdempotencyChecker {
    async fn is_step_executed(&self, workflow_id: &str, step_id: &str) -> bool {
        self.seen
            .read()
            .await
            .contains(&(workflow_id.to_string(), step_id.to_string()))
    }

    async fn mark_step_executed(&self, workflow_id: &str, step_id: &str) {
        self.seen
            .write()
            .await
            .insert((workflow_id.to_string(), step_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unseen_pair_reports_not_executed() {
        let checker = InMemoryIdempotencyChecker::new();
        assert!(!checker.is_step_executed("wf-1", "step-a").await);
    }

    #[tokio::test]
    async fn marked_pair_reports_executed() {
        let checker = InMemoryIdempotencyChecker::new();
        checker.mark_step_executed("wf-1", "step-a").await;
        assert!(checker.is_step_executed("wf-1", "step-a").await);
        assert!(!checker.is_step_executed("wf-1", "step-b").await);
        assert!(!checker.is_step_executed("wf-2", "step-a").await);
    }
}
