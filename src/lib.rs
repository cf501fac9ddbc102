//! In-process saga-style workflow orchestrator: a builder for sequential
//! steps with automatic retry, reverse-order compensation on failure, and
//! a small set of control-flow combinators (conditionals, loops,
//! parallel branches, fallbacks, timeouts) — all in one crate, with no
//! external broker or persistence layer.
//!
//! The typical shape:
//!
//! ```no_run
//! use saga_orchestrator::WorkflowEngine;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let engine = WorkflowEngine::new("create-user");
//! engine.add_sync_with_compensation(
//!     "persist-user",
//!     || Ok::<_, anyhow::Error>("user-1".to_string()),
//!     |_user_id: String| Ok(()),
//! )?;
//! let result = engine.execute().await?;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```

mod combinators;
mod compensation;
mod context;
mod defaults;
mod engine;
mod error;
mod executor;
mod idempotency;
mod observability;
mod step;

pub use combinators::{
    BodyFn, BranchFn, ControlKind, ControlStep, ItemProcessorFn, ItemsFn, PredicateFn,
};
pub use compensation::{CompensationEngine, CompensationReport};
pub use context::{Context, ContextSnapshot};
pub use engine::{ExecutionHandle, WorkflowEngine};
pub use error::{CompensationFailure, WorkflowError, WorkflowResult};
pub use executor::{DefaultStepExecutor, StepExecutor, StepFailure};
pub use idempotency::{IdempotencyChecker, InMemoryIdempotencyChecker};
pub use observability::{
    MetricsCollector, StepInterceptor, TracingStepInterceptor, WorkflowListener,
};
pub use step::{
    AsyncStep, AsyncStepBuilder, BoxFuture, NonRetryablePredicate, Step, StepConfig, SyncStep,
    SyncStepBuilder,
};

pub mod prelude {
    //! Common imports for building workflows.
    pub use crate::{
        Context, ExecutionHandle, StepExecutor, StepInterceptor, WorkflowEngine, WorkflowError,
        WorkflowListener, WorkflowResult,
    };
}
