use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::combinators::ControlKind;
use crate::compensation::CompensationEngine;
use crate::context::{self, Context};
use crate::defaults;
use crate::error::{CompensationFailure, WorkflowError, WorkflowResult};
use crate::executor::{DefaultStepExecutor, StepExecutor, StepFailure};
use crate::idempotency::{IdempotencyChecker, InMemoryIdempotencyChecker};
use crate::observability::{MetricsCollector, StepInterceptor, WorkflowListener};
use crate::step::{AsyncStep, AsyncStepBuilder, Step, SyncStep, SyncStepBuilder};

/// All of the engine's mutable builder/runner state, gathered behind a
/// single lock so every mutator is a short, synchronous critical section
/// (never held across an `.await`).
struct EngineState {
    name: String,
    logging_enabled: bool,
    skip_compensation: bool,
    executor_handle: Option<tokio::runtime::Handle>,
    step_executor: Arc<dyn StepExecutor>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    idempotency: Arc<dyn IdempotencyChecker>,
    interceptors: Vec<Arc<dyn StepInterceptor>>,
    listeners: Vec<Arc<dyn WorkflowListener>>,
    pending: VecDeque<Step>,
    executed: Vec<Step>,
    step_counter: usize,
    compensation_errors: Vec<CompensationFailure>,
}

/// Builder *and* runner for a single saga-style workflow execution. All
/// mutators (config setters, step enqueues, and the combinator methods
/// in `combinators.rs`) validate that the engine is not currently
/// executing, returning [`WorkflowError::InvalidState`] otherwise. The
/// engine is single-use by default; [`Self::reset`] returns it to a
/// fresh, re-runnable state.
pub struct WorkflowEngine {
    context: Arc<Context>,
    is_executing: Arc<AtomicBool>,
    state: Mutex<EngineState>,
}

impl WorkflowEngine {
    pub fn new(name: impl Into<String>) -> Self {
        let context = Arc::new(Context::new());
        Self::with_context(name, context)
    }

    fn with_context(name: impl Into<String>, context: Arc<Context>) -> Self {
        Self {
            context,
            is_executing: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(EngineState {
                name: name.into(),
                logging_enabled: defaults::DEFAULT_LOGGING_ENABLED,
                skip_compensation: defaults::DEFAULT_SKIP_COMPENSATION,
                executor_handle: tokio::runtime::Handle::try_current().ok(),
                step_executor: Arc::new(DefaultStepExecutor::new()),
                metrics: None,
                idempotency: Arc::new(InMemoryIdempotencyChecker::new()),
                interceptors: Vec::new(),
                listeners: Vec::new(),
                pending: VecDeque::new(),
                executed: Vec::new(),
                step_counter: 0,
                compensation_errors: Vec::new(),
            }),
        }
    }

    fn guard_not_executing(&self) -> WorkflowResult<()> {
        if self.is_executing.load(Ordering::SeqCst) {
            return Err(WorkflowError::InvalidState(
                "engine mutation attempted while executing".to_string(),
            ));
        }
        Ok(())
    }

    // ---- configuration -------------------------------------------------

    pub fn with_logging(&self, enabled: bool) -> WorkflowResult<()> {
        self.guard_not_executing()?;
        self.state.lock().unwrap_or_else(|e| e.into_inner()).logging_enabled = enabled;
        Ok(())
    }

    pub fn with_skip_compensation(&self, skip: bool) -> WorkflowResult<()> {
        self.guard_not_executing()?;
        self.state.lock().unwrap_or_else(|e| e.into_inner()).skip_compensation = skip;
        Ok(())
    }

    pub fn with_executor_handle(&self, handle: tokio::runtime::Handle) -> WorkflowResult<()> {
        self.guard_not_executing()?;
        self.state.lock().unwrap_or_else(|e| e.into_inner()).executor_handle = Some(handle);
        Ok(())
    }

    pub fn with_step_executor(&self, executor: Arc<dyn StepExecutor>) -> WorkflowResult<()> {
        self.guard_not_executing()?;
        self.state.lock().unwrap_or_else(|e| e.into_inner()).step_executor = executor;
        Ok(())
    }

    pub fn with_metrics_collector(&self, metrics: Arc<dyn MetricsCollector>) -> WorkflowResult<()> {
        self.guard_not_executing()?;
        self.state.lock().unwrap_or_else(|e| e.into_inner()).metrics = Some(metrics);
        Ok(())
    }

    pub fn with_idempotency_checker(&self, checker: Arc<dyn IdempotencyChecker>) -> WorkflowResult<()> {
        self.guard_not_executing()?;
        self.state.lock().unwrap_or_else(|e| e.into_inner()).idempotency = checker;
        Ok(())
    }

    pub fn with_interceptor(&self, interceptor: Arc<dyn StepInterceptor>) -> WorkflowResult<()> {
        self.guard_not_executing()?;
        self.state.lock().unwrap_or_else(|e| e.into_inner()).interceptors.push(interceptor);
        Ok(())
    }

    pub fn with_listener(&self, listener: Arc<dyn WorkflowListener>) -> WorkflowResult<()> {
        self.guard_not_executing()?;
        self.state.lock().unwrap_or_else(|e| e.into_inner()).listeners.push(listener);
        Ok(())
    }

    // ---- step enqueue ----------------------------------------------------

    pub fn add_sync_step(&self, step: SyncStep) -> WorkflowResult<()> {
        self.guard_not_executing()?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.step_counter += 1;
        state.pending.push_back(Step::Sync(step));
        Ok(())
    }

    pub fn add_async_step(&self, step: AsyncStep) -> WorkflowResult<()> {
        self.guard_not_executing()?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.step_counter += 1;
        state.pending.push_back(Step::Async(step));
        Ok(())
    }

    pub(crate) fn add_control(&self, step: crate::combinators::ControlStep) -> WorkflowResult<()> {
        self.guard_not_executing()?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.step_counter += 1;
        state.pending.push_back(Step::Control(step));
        Ok(())
    }

    /// `(name, action)`.
    pub fn add_sync<T>(
        &self,
        name: impl Into<String>,
        action: impl Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> WorkflowResult<()>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.add_sync_step(SyncStepBuilder::new(name, action).build())
    }

    /// `(name, action, compensation)`.
    pub fn add_sync_with_compensation<T>(
        &self,
        name: impl Into<String>,
        action: impl Fn() -> anyhow::Result<T> + Send + Sync + 'static,
        compensation: impl Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> WorkflowResult<()>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.add_sync_step(
            SyncStepBuilder::new(name, action)
                .with_compensation(compensation)
                .build(),
        )
    }

    /// `(name, runnable)`: a void action, normalised to one returning unit.
    pub fn add_runnable(
        &self,
        name: impl Into<String>,
        runnable: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> WorkflowResult<()> {
        self.add_sync(name, runnable)
    }

    /// `(name, action)`, async.
    pub fn add_async<T, F, Fut>(&self, name: impl Into<String>, action: F) -> WorkflowResult<()>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.add_async_step(AsyncStepBuilder::new(name, action).build())
    }

    /// `(name, action, compensation)`, async.
    pub fn add_async_with_compensation<T, F, Fut, C, CFut>(
        &self,
        name: impl Into<String>,
        action: F,
        compensation: C,
    ) -> WorkflowResult<()>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
        C: Fn(T) -> CFut + Send + Sync + 'static,
        CFut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_async_step(
            AsyncStepBuilder::new(name, action)
                .with_compensation(compensation)
                .build(),
        )
    }

    /// `(name, runnable)`, async void action.
    pub fn add_async_runnable<F, Fut>(&self, name: impl Into<String>, runnable: F) -> WorkflowResult<()>
    where
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_async(name, runnable)
    }

    // ---- inspection -------------------------------------------------------

    pub fn workflow_id(&self) -> uuid::Uuid {
        self.context.id()
    }

    pub fn is_executing(&self) -> bool {
        self.is_executing.load(Ordering::SeqCst)
    }

    pub async fn get_context_snapshot(&self) -> context::ContextSnapshot {
        self.context.snapshot().await
    }

    pub fn get_executed_step_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).executed.len()
    }

    pub fn get_executed_step_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .executed
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub async fn get_execution_trace(&self) -> Vec<(chrono::DateTime<chrono::Utc>, String)> {
        self.context.trace().await
    }

    /// Returns the engine to a fresh, re-runnable state: clears the
    /// pending queue, executed-step list and compensation errors,
    /// preserving configuration (name, collectors, interceptors,
    /// listeners). The underlying context is reused rather than
    /// replaced; re-enqueuing the same deterministic steps after a reset
    /// still produces the same `executedStepNames` and final result,
    /// since each step's recorded value simply gets overwritten again.
    pub fn reset(&self) -> WorkflowResult<()> {
        self.guard_not_executing()?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.clear();
        state.executed.clear();
        state.compensation_errors.clear();
        state.step_counter = 0;
        Ok(())
    }

    // ---- sub-engines (combinators) -----------------------------------------

    /// Builds a fresh sub-engine inheriting this engine's name prefix,
    /// logging/skip-compensation flags, executor handle, step executor,
    /// and metrics collector, seeded with an independent `context`.
    pub(crate) fn sub_engine(&self, suffix: &str, context: Arc<Context>) -> WorkflowEngine {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let sub = WorkflowEngine::with_context(format!("{}/{}", state.name, suffix), context);
        {
            let mut sub_state = sub.state.lock().unwrap_or_else(|e| e.into_inner());
            sub_state.logging_enabled = state.logging_enabled;
            sub_state.skip_compensation = state.skip_compensation;
            sub_state.executor_handle = state.executor_handle.clone();
            sub_state.step_executor = state.step_executor.clone();
            sub_state.metrics = state.metrics.clone();
            sub_state.idempotency = state.idempotency.clone();
            sub_state.interceptors = state.interceptors.clone();
            sub_state.listeners = state.listeners.clone();
        }
        sub
    }

    /// Drains this engine's pending queue, handing ownership of every
    /// step to the caller. Used by the parent runner to flatten a
    /// conditional/for-each sub-engine's steps into its own queue.
    fn drain_pending(&self) -> Vec<Step> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).pending.drain(..).collect()
    }

    fn executor_handle(&self) -> Option<tokio::runtime::Handle> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).executor_handle.clone()
    }

    // ---- execution ----------------------------------------------------------

    /// Blocking execution: runs to completion (including compensation on
    /// failure) and returns the workflow's final result.
    pub async fn execute(&self) -> WorkflowResult<Value> {
        if self.is_executing.swap(true, Ordering::SeqCst) {
            return Err(WorkflowError::InvalidState(
                "execute() called on an already-executing engine".to_string(),
            ));
        }

        let name = self.state.lock().unwrap_or_else(|e| e.into_inner()).name.clone();
        let logging_enabled = self.state.lock().unwrap_or_else(|e| e.into_inner()).logging_enabled;

        self.context.put(context::KEY_WORKFLOW_NAME, Value::String(name.clone())).await;
        self.context
            .put(context::KEY_EXECUTION_ID, Value::String(uuid::Uuid::new_v4().to_string()))
            .await;
        self.context
            .put(context::KEY_START_TIME, Value::String(chrono::Utc::now().to_rfc3339()))
            .await;

        self.notify_workflow_start(&name).await;
        self.context
            .log_trace(format!("workflow '{name}' started"))
            .await;
        if logging_enabled {
            info!(workflow = %name, "workflow started");
        }

        let result = self.run_loop(&name, logging_enabled).await;

        match &result {
            Ok(value) => {
                self.notify_workflow_complete(&name, value).await;
                self.context
                    .log_trace(format!("workflow '{name}' completed"))
                    .await;
                if logging_enabled {
                    info!(workflow = %name, "workflow completed");
                }
            }
            Err(_) => {
                // `run_loop` already fired `on_workflow_error` before running
                // compensation, so listeners see the failure ahead of any
                // compensation callbacks.
            }
        }

        self.is_executing.store(false, Ordering::SeqCst);
        result
    }

    /// Non-blocking execution: spawns `execute()` on `self`'s executor
    /// handle (or the ambient Tokio runtime) and returns a handle that
    /// can be awaited or cancelled.
    pub fn execute_async(self: &Arc<Self>) -> ExecutionHandle {
        let engine = Arc::clone(self);
        let is_executing = Arc::clone(&self.is_executing);
        let handle_opt = self.executor_handle();

        let join = match handle_opt {
            Some(handle) => handle.spawn(async move { engine.execute().await }),
            None => tokio::spawn(async move { engine.execute().await }),
        };

        ExecutionHandle { join, is_executing }
    }

    async fn run_loop(&self, name: &str, logging_enabled: bool) -> WorkflowResult<Value> {
        let mut step_number = 0usize;
        loop {
            let step = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                match state.pending.pop_front() {
                    Some(step) => step,
                    None => break,
                }
            };
            step_number += 1;

            if step.is_idempotent() {
                let idempotency = self.state.lock().unwrap_or_else(|e| e.into_inner()).idempotency.clone();
                if idempotency
                    .is_step_executed(&self.context.id().to_string(), step.id())
                    .await
                {
                    debug!(step_name = step.name(), "idempotent step already executed, skipping");
                    continue;
                }
            }

            self.notify_before_step(step.name()).await;

            let outcome = self.run_step(&step).await;

            match outcome {
                Ok(value) => {
                    self.record_success(&step).await;
                    self.context.put(context::KEY_LAST_RESULT, value.clone()).await;
                    self.context.put(context::KEY_FINAL_RESULT, value.clone()).await;
                    let key = format!(
                        "{}{}",
                        context::STEP_RESULT_PREFIX,
                        context::sanitise_step_name(step.name())
                    );
                    self.context.put(key, value.clone()).await;
                    self.context.record_step_result(step.id(), value.clone()).await;

                    self.notify_after_step(step.name(), &value).await;
                    if logging_enabled {
                        info!(step_name = step.name(), "step completed");
                    }

                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.executed.push(step);
                }
                Err(failure) => {
                    let message = failure.to_string();
                    self.context.record_step_error(step.id(), message.clone()).await;
                    self.notify_step_error(step.name(), &message).await;
                    warn!(step_name = step.name(), error = %message, "step failed");

                    let cause: anyhow::Error = match failure {
                        StepFailure::Action(e) => e,
                        StepFailure::TimedOut => anyhow::Error::new(WorkflowError::StepTimedOut {
                            step_name: step.name().to_string(),
                        }),
                        StepFailure::Interrupted => {
                            anyhow::Error::new(WorkflowError::WorkflowInterrupted {
                                step_name: step.name().to_string(),
                            })
                        }
                    };

                    let wrapped = if step.is_critical() {
                        anyhow::Error::new(WorkflowError::CriticalStepFailed {
                            step_name: step.name().to_string(),
                            cause,
                        })
                    } else {
                        cause
                    };

                    self.context
                        .put(
                            context::KEY_ERROR_CONTEXT,
                            serde_json::json!({"step": step.name(), "message": wrapped.to_string()}),
                        )
                        .await;
                    self.notify_workflow_error(name, &wrapped.to_string()).await;

                    let skip_compensation = self.state.lock().unwrap_or_else(|e| e.into_inner()).skip_compensation;
                    let compensation_errors = if skip_compensation {
                        Vec::new()
                    } else {
                        let executed = self.state.lock().unwrap_or_else(|e| e.into_inner()).executed.clone();
                        let (metrics, listeners) = {
                            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                            (state.metrics.clone(), state.listeners.clone())
                        };
                        let compensation_engine = CompensationEngine::new(metrics, listeners);
                        let report = compensation_engine
                            .compensate(name, &executed, &self.context)
                            .await;
                        report.errors
                    };

                    return Err(WorkflowError::WorkflowFailed {
                        workflow_name: name.to_string(),
                        step_number,
                        cause: wrapped,
                        compensation_errors,
                    });
                }
            }
        }

        let final_result = self
            .context
            .get(context::KEY_FINAL_RESULT)
            .await
            .unwrap_or(Value::Null);
        Ok(final_result)
    }

    async fn record_success(&self, step: &Step) {
        self.context.mark_executed(step.id()).await;
        if step.is_idempotent() {
            let idempotency = self.state.lock().unwrap_or_else(|e| e.into_inner()).idempotency.clone();
            idempotency
                .mark_step_executed(&self.context.id().to_string(), step.id())
                .await;
        }
    }

    async fn run_step(&self, step: &Step) -> Result<Value, StepFailure> {
        match step {
            Step::Control(control) => self.run_control_step(control).await,
            _ => {
                let (executor, metrics) = {
                    let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    (state.step_executor.clone(), state.metrics.clone())
                };
                executor.execute(step, &self.context, metrics.as_ref()).await
            }
        }
    }

    // ---- hooks -----------------------------------------------------------

    async fn notify_workflow_start(&self, name: &str) {
        let listeners = self.state.lock().unwrap_or_else(|e| e.into_inner()).listeners.clone();
        for listener in &listeners {
            listener.on_workflow_start(name).await;
        }
    }

    async fn notify_workflow_complete(&self, name: &str, result: &Value) {
        let listeners = self.state.lock().unwrap_or_else(|e| e.into_inner()).listeners.clone();
        for listener in &listeners {
            listener.on_workflow_complete(name, result).await;
        }
    }

    async fn notify_workflow_error(&self, name: &str, error: &str) {
        let listeners = self.state.lock().unwrap_or_else(|e| e.into_inner()).listeners.clone();
        for listener in &listeners {
            listener.on_workflow_error(name, error).await;
        }
    }

    async fn notify_before_step(&self, step_name: &str) {
        let interceptors = self.state.lock().unwrap_or_else(|e| e.into_inner()).interceptors.clone();
        for interceptor in &interceptors {
            interceptor.before_step(step_name).await;
        }
    }

    async fn notify_after_step(&self, step_name: &str, result: &Value) {
        let interceptors = self.state.lock().unwrap_or_else(|e| e.into_inner()).interceptors.clone();
        for interceptor in &interceptors {
            interceptor.after_step(step_name, result).await;
        }
    }

    async fn notify_step_error(&self, step_name: &str, error: &str) {
        let interceptors = self.state.lock().unwrap_or_else(|e| e.into_inner()).interceptors.clone();
        for interceptor in &interceptors {
            interceptor.on_step_error(step_name, error).await;
        }
    }

    // ---- combinator execution ---------------------------------------------

    async fn run_control_step(
        &self,
        control: &crate::combinators::ControlStep,
    ) -> Result<Value, StepFailure> {
        match control.kind() {
            ControlKind::Conditional {
                predicate,
                then_body,
                else_body,
            } => {
                if predicate(self.context.clone()).await {
                    self.flatten_body(&control.name, then_body).await;
                } else if let Some(else_body) = else_body {
                    self.flatten_body(&control.name, else_body).await;
                }
                Ok(Value::Bool(true))
            }

            ControlKind::Repeat { count, body } => {
                for i in 0..*count {
                    let snapshot = Arc::new(self.context.deep_copy().await);
                    let sub = self.sub_engine(&format!("{}-Repeat-{i}", control.name), snapshot);
                    let sub = body(sub);
                    sub.execute()
                        .await
                        .map_err(|e| StepFailure::Action(anyhow::Error::new(e)))?;
                }
                Ok(Value::from(*count))
            }

            ControlKind::ForEach { items, processor } => {
                let items = items(self.context.clone()).await;
                for (index, item) in items.into_iter().enumerate() {
                    self.context.put(context::KEY_CURRENT_ITEM, item.clone()).await;
                    self.context
                        .put(context::KEY_ITEM_INDEX, Value::from(index))
                        .await;

                    let sub = self.sub_engine(
                        &format!("{}-Item-{index}", control.name),
                        self.context.clone(),
                    );
                    let processor = processor.clone();
                    let item_for_step = item.clone();
                    sub.add_async_runnable("Process item", move |ctx| {
                        let processor = processor.clone();
                        let item = item_for_step.clone();
                        async move { processor(ctx, item, index).await }
                    })
                    .map_err(|e| StepFailure::Action(anyhow::Error::new(e)))?;

                    sub.execute()
                        .await
                        .map_err(|e| StepFailure::Action(anyhow::Error::new(e)))?;
                }
                Ok(Value::Null)
            }

            ControlKind::ForEachAsync { items, processor } => {
                let items = items(self.context.clone()).await;
                let futures = items.into_iter().enumerate().map(|(index, item)| {
                    let context = self.context.clone();
                    let processor = processor.clone();
                    async move {
                        context.put(context::KEY_CURRENT_ITEM, item.clone()).await;
                        context
                            .put(context::KEY_ITEM_INDEX, Value::from(index))
                            .await;
                        if let Err(e) = processor(context.clone(), item, index).await {
                            warn!(index, error = %e, "forEachAsync item failed, suppressing");
                        }
                    }
                });
                join_all(futures).await;
                Ok(Value::Null)
            }

            ControlKind::Parallel { branches } => {
                let futures = branches.iter().map(|branch| {
                    let branch = branch.clone();
                    let context = self.context.clone();
                    async move {
                        let snapshot = Arc::new(context.deep_copy().await);
                        branch(snapshot).await
                    }
                });
                let results = join_all(futures).await;
                let mut values = Vec::with_capacity(results.len());
                for result in results {
                    values.push(result.map_err(StepFailure::Action)?);
                }
                Ok(Value::Array(values))
            }

            ControlKind::Fallback { main, fallback } => {
                match main(self.context.clone()).await {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        warn!(step_name = %control.name, error = %e, "main action failed, using fallback");
                        fallback(self.context.clone()).await.map_err(StepFailure::Action)
                    }
                }
            }

            ControlKind::Timeout { action, duration } => {
                match tokio::time::timeout(*duration, action(self.context.clone())).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(StepFailure::Action(e)),
                    Err(_) => Err(StepFailure::TimedOut),
                }
            }

            ControlKind::Log { message } => {
                self.context.log_trace(message.clone()).await;
                let logging_enabled = self.state.lock().unwrap_or_else(|e| e.into_inner()).logging_enabled;
                if logging_enabled {
                    info!(message = %message, "workflow log");
                }
                Ok(Value::String(message.clone()))
            }
        }
    }

    async fn flatten_body(&self, name: &str, body: &crate::combinators::BodyFn) {
        let snapshot = Arc::new(self.context.deep_copy().await);
        let sub = self.sub_engine(name, snapshot);
        let sub = body(sub);
        let steps = sub.drain_pending();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for step in steps.into_iter().rev() {
            state.pending.push_front(step);
        }
    }
}

/// Handle to a non-blocking execution. `cancel()` aborts the underlying
/// task and clears the executing flag immediately rather than waiting
/// for the task to notice.
pub struct ExecutionHandle {
    join: JoinHandle<WorkflowResult<Value>>,
    is_executing: Arc<AtomicBool>,
}

impl ExecutionHandle {
    pub async fn join(self) -> WorkflowResult<Value> {
        match self.join.await {
            Ok(result) => result,
            Err(join_err) => {
                self.is_executing.store(false, Ordering::SeqCst);
                if join_err.is_cancelled() {
                    Err(WorkflowError::WorkflowInterrupted {
                        step_name: "<execution cancelled>".to_string(),
                    })
                } else {
                    Err(WorkflowError::InvalidState(format!(
                        "execution task panicked: {join_err}"
                    )))
                }
            }
        }
    }

    pub fn cancel(&self) {
        self.join.abort();
        self.is_executing.store(false, Ordering::SeqCst);
    }

    pub fn is_executing(&self) -> bool {
        self.is_executing.load(Ordering::SeqCst)
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new("workflow")
    }
}
