//! Control-flow combinators: conditionals, loops, fan-out, fallback and
//! timeout. Each combinator enqueues a single synthetic [`ControlStep`]
//! that the engine's runner recognises and drives specially, see
//! `engine::WorkflowEngine::run_control_step`, rather than routing it
//! through the generic retrying step executor.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::context::Context;
use crate::engine::WorkflowEngine;
use crate::step::{BoxFuture, StepConfig};

pub type PredicateFn = Arc<dyn Fn(Arc<Context>) -> BoxFuture<'static, bool> + Send + Sync>;
pub type BodyFn = Arc<dyn Fn(WorkflowEngine) -> WorkflowEngine + Send + Sync>;
pub type ItemsFn = Arc<dyn Fn(Arc<Context>) -> BoxFuture<'static, Vec<Value>> + Send + Sync>;
pub type ItemProcessorFn =
    Arc<dyn Fn(Arc<Context>, Value, usize) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type BranchFn = Arc<dyn Fn(Arc<Context>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// The payload of a synthetic combinator step. Variant names mirror the
/// combinator that produces them.
#[derive(Clone)]
pub enum ControlKind {
    /// `when`/`ifThen`/`ifThenElse`: evaluate `predicate`, then flatten
    /// either `then_body`'s or `else_body`'s sub-engine steps into the
    /// parent queue. Never starts a nested runner.
    Conditional {
        predicate: PredicateFn,
        then_body: BodyFn,
        else_body: Option<BodyFn>,
    },
    /// `repeat`: materialises and *executes* a sub-engine inline, once
    /// per iteration, within this single step. Deliberately asymmetric
    /// with `Conditional`, which flattens instead of executing.
    Repeat { count: usize, body: BodyFn },
    /// `forEach`: enumerates the collection serially, writing
    /// `current_item`/`item_index` into the parent context before each
    /// item, then executes a one-step "process item" sub-engine inline
    /// (same shared context, so `StepInterceptor` hooks and retry/timeout
    /// semantics apply per item) before moving to the next.
    ForEach {
        items: ItemsFn,
        processor: ItemProcessorFn,
    },
    /// `forEachAsync`: fans every item out in parallel on the engine's
    /// executor handle; per-item failure is logged and suppressed.
    ForEachAsync {
        items: ItemsFn,
        processor: ItemProcessorFn,
    },
    /// `parallel`: launches each branch as an independent, isolated
    /// sub-engine execution seeded with a context snapshot. Branches are
    /// NOT merged into the parent's executed-step list; this is an
    /// intentional isolation of parallel branches from the parent's
    /// compensation bookkeeping.
    Parallel { branches: Vec<BranchFn> },
    /// `withFallback`: runs `main`; on any failure runs `fallback` and
    /// returns its result instead.
    Fallback { main: BranchFn, fallback: BranchFn },
    /// `withTimeout`: dispatches `action` and waits at most `duration`,
    /// raising `StepTimedOut` on expiry.
    Timeout { action: BranchFn, duration: Duration },
    /// `log`: records a pre-formatted message in the context trace (and
    /// the runtime log, if enabled), returning it as the step's value.
    Log { message: String },
}

/// A synthetic step produced by a combinator. See the module docs for
/// why this is a third [`crate::step::Step`] variant rather than a
/// generic action.
#[derive(Clone)]
pub struct ControlStep {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) kind: ControlKind,
    pub(crate) config: StepConfig,
}

impl ControlStep {
    pub fn kind(&self) -> &ControlKind {
        &self.kind
    }
}

impl fmt::Debug for ControlStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

fn new_control(name: impl Into<String>, kind: ControlKind) -> ControlStep {
    ControlStep {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.into(),
        kind,
        config: StepConfig {
            // Combinator steps are meta-steps: they drive other steps
            // rather than perform I/O themselves, so the default
            // per-step timeout does not apply to the evaluator itself.
            timeout: None,
            ..StepConfig::default()
        },
    }
}

impl WorkflowEngine {
    /// `when(predicate, body)`: runs `body` only if `predicate` holds.
    pub fn when<P, F>(&self, name: impl Into<String>, predicate: P, body: F) -> crate::error::WorkflowResult<()>
    where
        P: Fn(Arc<Context>) -> BoxFuture<'static, bool> + Send + Sync + 'static,
        F: Fn(WorkflowEngine) -> WorkflowEngine + Send + Sync + 'static,
    {
        self.add_control(new_control(
            name,
            ControlKind::Conditional {
                predicate: Arc::new(predicate),
                then_body: Arc::new(body),
                else_body: None,
            },
        ))
    }

    /// `when(key, expected, body)`: `when(() -> context[key] == expected, body)`.
    pub fn when_eq<F>(
        &self,
        name: impl Into<String>,
        key: impl Into<String>,
        expected: Value,
        body: F,
    ) -> crate::error::WorkflowResult<()>
    where
        F: Fn(WorkflowEngine) -> WorkflowEngine + Send + Sync + 'static,
    {
        let key = key.into();
        self.when(
            name,
            move |ctx: Arc<Context>| {
                let key = key.clone();
                let expected = expected.clone();
                Box::pin(async move { ctx.get(&key).await.as_ref() == Some(&expected) })
            },
            body,
        )
    }

    /// `ifThenElse(predicate, thenBody, elseBody)`.
    pub fn if_then_else<P, T, E>(
        &self,
        name: impl Into<String>,
        predicate: P,
        then_body: T,
        else_body: E,
    ) -> crate::error::WorkflowResult<()>
    where
        P: Fn(Arc<Context>) -> BoxFuture<'static, bool> + Send + Sync + 'static,
        T: Fn(WorkflowEngine) -> WorkflowEngine + Send + Sync + 'static,
        E: Fn(WorkflowEngine) -> WorkflowEngine + Send + Sync + 'static,
    {
        self.add_control(new_control(
            name,
            ControlKind::Conditional {
                predicate: Arc::new(predicate),
                then_body: Arc::new(then_body),
                else_body: Some(Arc::new(else_body)),
            },
        ))
    }

    /// `repeat(n, body)`: runs `body`'s sub-engine to completion once per
    /// iteration, named `<name>-Repeat-<i>`.
    pub fn repeat<F>(&self, name: impl Into<String>, count: usize, body: F) -> crate::error::WorkflowResult<()>
    where
        F: Fn(WorkflowEngine) -> WorkflowEngine + Send + Sync + 'static,
    {
        self.add_control(new_control(
            name,
            ControlKind::Repeat {
                count,
                body: Arc::new(body),
            },
        ))
    }

    /// `forEach(collectionSupplier, itemProcessor)`, serial.
    pub fn for_each<I, P>(&self, name: impl Into<String>, items: I, processor: P) -> crate::error::WorkflowResult<()>
    where
        I: Fn(Arc<Context>) -> BoxFuture<'static, Vec<Value>> + Send + Sync + 'static,
        P: Fn(Arc<Context>, Value, usize) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.add_control(new_control(
            name,
            ControlKind::ForEach {
                items: Arc::new(items),
                processor: Arc::new(processor),
            },
        ))
    }

    /// `forEachAsync(collectionSupplier, itemProcessor)`: fans out onto
    /// the engine's executor handle; failures are suppressed per item.
    pub fn for_each_async<I, P>(
        &self,
        name: impl Into<String>,
        items: I,
        processor: P,
    ) -> crate::error::WorkflowResult<()>
    where
        I: Fn(Arc<Context>) -> BoxFuture<'static, Vec<Value>> + Send + Sync + 'static,
        P: Fn(Arc<Context>, Value, usize) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.add_control(new_control(
            name,
            ControlKind::ForEachAsync {
                items: Arc::new(items),
                processor: Arc::new(processor),
            },
        ))
    }

    /// `parallel(branches...)`: every branch must succeed for the step to
    /// succeed; branches are isolated from the parent's compensation
    /// bookkeeping.
    pub fn parallel<B>(&self, name: impl Into<String>, branches: Vec<B>) -> crate::error::WorkflowResult<()>
    where
        B: Fn(Arc<Context>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
    {
        let branches: Vec<BranchFn> = branches
            .into_iter()
            .map(|b| Arc::new(b) as BranchFn)
            .collect();
        self.add_control(new_control(name, ControlKind::Parallel { branches }))
    }

    /// `withFallback(main, fallback)`.
    pub fn with_fallback<M, F>(&self, name: impl Into<String>, main: M, fallback: F) -> crate::error::WorkflowResult<()>
    where
        M: Fn(Arc<Context>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
        F: Fn(Arc<Context>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
    {
        self.add_control(new_control(
            name,
            ControlKind::Fallback {
                main: Arc::new(main),
                fallback: Arc::new(fallback),
            },
        ))
    }

    /// `withTimeout(name, action, duration)`.
    pub fn with_timeout<A>(&self, name: impl Into<String>, action: A, duration: Duration) -> crate::error::WorkflowResult<()>
    where
        A: Fn(Arc<Context>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
    {
        self.add_control(new_control(
            name,
            ControlKind::Timeout {
                action: Arc::new(action),
                duration,
            },
        ))
    }

    /// `log(format, args...)`: callers format the message themselves
    /// (idiomatic `format!()` already covers "format, args...").
    pub fn log(&self, message: impl Into<String>) -> crate::error::WorkflowResult<()> {
        self.add_control(new_control(
            "log",
            ControlKind::Log {
                message: message.into(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_control_generates_id_and_disables_default_timeout() {
        let step = new_control("noop", ControlKind::Log { message: "hi".into() });
        assert!(uuid::Uuid::parse_str(&step.id).is_ok());
        assert_eq!(step.name, "noop");
        assert!(step.config.timeout.is_none());
    }
}
