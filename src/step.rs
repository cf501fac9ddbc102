use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::context::Context;
use crate::defaults;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type SyncActionFn = Arc<dyn Fn() -> anyhow::Result<Value> + Send + Sync>;
type SyncCompensationFn = Arc<dyn Fn(Value) -> anyhow::Result<()> + Send + Sync>;
type AsyncActionFn = Arc<dyn Fn(Arc<Context>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type AsyncCompensationFn = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Predicate a caller can register to declare a class of error as
/// non-retryable: when it returns true for a step's failure, the
/// executor rethrows immediately instead of retrying.
pub type NonRetryablePredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Retry/timeout/criticality metadata shared by both step variants.
///
/// Tie-breaks are applied by the setters, not by the executor:
/// `max_retries < 0` is impossible here since the field is `u32` (the
/// builder clamps any caller-supplied negative directly), a zero or
/// negative `retry_delay` is simply a zero `Duration` (no sleep occurs),
/// and `timeout <= 0` is represented as `None`.
#[derive(Clone)]
pub struct StepConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Option<Duration>,
    pub critical: bool,
    pub idempotent: bool,
    pub metadata: HashMap<String, Value>,
    pub non_retryable: Option<NonRetryablePredicate>,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::DEFAULT_MAX_RETRIES,
            retry_delay: defaults::DEFAULT_RETRY_DELAY,
            timeout: Some(defaults::DEFAULT_STEP_TIMEOUT),
            critical: false,
            idempotent: false,
            metadata: HashMap::new(),
            non_retryable: None,
        }
    }
}

/// A step whose action runs synchronously on the calling task.
#[derive(Clone)]
pub struct SyncStep {
    pub id: String,
    pub name: String,
    pub(crate) action: SyncActionFn,
    pub(crate) compensation: Option<SyncCompensationFn>,
    pub config: StepConfig,
}

impl fmt::Debug for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("critical", &self.config.critical)
            .field("idempotent", &self.config.idempotent)
            .finish()
    }
}

/// A step whose action returns a future the engine awaits, receiving the
/// shared context (so async actions can read/write it mid-flight).
#[derive(Clone)]
pub struct AsyncStep {
    pub id: String,
    pub name: String,
    pub(crate) action: AsyncActionFn,
    pub(crate) compensation: Option<AsyncCompensationFn>,
    pub config: StepConfig,
}

impl fmt::Debug for AsyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("critical", &self.config.critical)
            .field("idempotent", &self.config.idempotent)
            .finish()
    }
}

/// The heterogeneous, FIFO-ordered unit the engine's pending queue holds.
/// A single `match` in the runner dispatches on this tag rather than on
/// a trait object.
///
/// `Control` carries the synthetic steps the control-flow combinators
/// enqueue; the runner recognises the tag and drives it through
/// `engine::WorkflowEngine::run_control_step` instead of the generic
/// retrying [`crate::executor::StepExecutor`], since a conditional/loop
/// body needs to splice further steps into the parent queue rather than
/// just produce a value.
#[derive(Clone, Debug)]
pub enum Step {
    Sync(SyncStep),
    Async(AsyncStep),
    Control(crate::combinators::ControlStep),
}

impl Step {
    pub fn id(&self) -> &str {
        match self {
            Step::Sync(s) => &s.id,
            Step::Async(s) => &s.id,
            Step::Control(s) => &s.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Step::Sync(s) => &s.name,
            Step::Async(s) => &s.name,
            Step::Control(s) => &s.name,
        }
    }

    pub fn config(&self) -> &StepConfig {
        match self {
            Step::Sync(s) => &s.config,
            Step::Async(s) => &s.config,
            Step::Control(s) => &s.config,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.config().critical
    }

    pub fn is_idempotent(&self) -> bool {
        self.config().idempotent
    }

    pub fn has_compensation(&self) -> bool {
        match self {
            Step::Sync(s) => s.compensation.is_some(),
            Step::Async(s) => s.compensation.is_some(),
            Step::Control(_) => false,
        }
    }
}

/// Builds a [`Step::Sync`] from a typed action/compensation pair.
///
/// `T` only needs `Serialize` on the way out (the result is erased to
/// `serde_json::Value` for storage in [`Context`]) and `DeserializeOwned`
/// on the way back in for the compensation, mirroring how this codebase's
/// saga client already threads `serde_json::Value` payloads between
/// services.
pub struct SyncStepBuilder<T> {
    id: Option<String>,
    name: String,
    action: Arc<dyn Fn() -> anyhow::Result<T> + Send + Sync>,
    compensation: Option<Arc<dyn Fn(T) -> anyhow::Result<()> + Send + Sync>>,
    config: StepConfig,
}

impl<T> SyncStepBuilder<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        action: impl Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            action: Arc::new(action),
            compensation: None,
            config: StepConfig::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_compensation(
        mut self,
        compensation: impl Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.compensation = Some(Arc::new(compensation));
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.config.max_retries = max_retries.max(0) as u32;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.config.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.config.critical = critical;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.config.idempotent = idempotent;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.metadata.insert(key.into(), value);
        self
    }

    pub fn non_retryable_if(
        mut self,
        predicate: impl Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.config.non_retryable = Some(Arc::new(predicate));
        self
    }

    pub fn build(self) -> SyncStep {
        let action = self.action.clone();
        let erased_action: SyncActionFn = Arc::new(move || {
            let value = action()?;
            Ok(serde_json::to_value(value)?)
        });

        let erased_compensation: Option<SyncCompensationFn> =
            self.compensation.map(|compensation| {
                let compensation = compensation.clone();
                Arc::new(move |value: Value| -> anyhow::Result<()> {
                    let typed: T = serde_json::from_value(value)?;
                    compensation(typed)
                }) as SyncCompensationFn
            });

        SyncStep {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.name,
            action: erased_action,
            compensation: erased_compensation,
            config: self.config,
        }
    }
}

/// Builds a [`Step::Async`] from a typed action/compensation pair.
pub struct AsyncStepBuilder<T> {
    id: Option<String>,
    name: String,
    action: Arc<
        dyn Fn(Arc<Context>) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync,
    >,
    compensation:
        Option<Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>>,
    config: StepConfig,
}

impl<T> AsyncStepBuilder<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            id: None,
            name: name.into(),
            action: Arc::new(move |ctx| Box::pin(action(ctx))),
            compensation: None,
            config: StepConfig::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_compensation<F, Fut>(mut self, compensation: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.compensation = Some(Arc::new(move |value| Box::pin(compensation(value))));
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.config.max_retries = max_retries.max(0) as u32;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.config.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.config.critical = critical;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.config.idempotent = idempotent;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.metadata.insert(key.into(), value);
        self
    }

    pub fn non_retryable_if(
        mut self,
        predicate: impl Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.config.non_retryable = Some(Arc::new(predicate));
        self
    }

    pub fn build(self) -> AsyncStep {
        let action = self.action.clone();
        let erased_action: AsyncActionFn = Arc::new(move |ctx| {
            let fut = action(ctx);
            Box::pin(async move {
                let value = fut.await?;
                Ok(serde_json::to_value(value)?)
            })
        });

        let erased_compensation: Option<AsyncCompensationFn> =
            self.compensation.map(|compensation| {
                let compensation = compensation.clone();
                Arc::new(move |value: Value| -> BoxFuture<'static, anyhow::Result<()>> {
                    let compensation = compensation.clone();
                    Box::pin(async move {
                        let typed: T = serde_json::from_value(value)?;
                        compensation(typed).await
                    })
                }) as AsyncCompensationFn
            });

        AsyncStep {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.name,
            action: erased_action,
            compensation: erased_compensation,
            config: self.config,
        }
    }
}
