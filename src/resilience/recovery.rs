//! Recovery actions keyed by strategy.
//!
//! # Responsibilities
//! - Hold named, bounded remediation procedures per [`RecoveryStrategy`]
//! - Run them in registration order, stopping at the first success
//! - Track whether the component was flagged unrecoverable
//!
//! # Design Decisions
//! - Actions are async closures over an owned [`RecoveryContext`]
//! - `NotApplicable` skips an action without consuming its attempts
//! - `Unrecoverable` aborts the whole run
//! - `Escalate` has no actions; it always surfaces to the caller

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;

use crate::config::schema::ExceptionConfig;
use crate::pool::ConnectionError;
use crate::resilience::classifier::{Classification, RecoveryStrategy};

/// Something that can drop its upstream handle and establish a new one.
pub trait Reconnect: Send + Sync {
    fn reconnect(&self) -> BoxFuture<'_, Result<(), ConnectionError>>;

    /// Identifier used in logs.
    fn label(&self) -> String;
}

/// Input handed to every recovery action.
#[derive(Clone)]
pub struct RecoveryContext {
    pub classification: Classification,
    pub message: String,
    /// Connection to reset, when the failure is tied to one.
    pub target: Option<Arc<dyn Reconnect>>,
}

impl fmt::Debug for RecoveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryContext")
            .field("classification", &self.classification)
            .field("message", &self.message)
            .field("target", &self.target.as_ref().map(|t| t.label()))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    /// The action does not apply to this context (e.g. no connection to reset).
    #[error("action not applicable")]
    NotApplicable,

    #[error("action failed: {0}")]
    Failed(String),

    #[error("action timed out after {0:?}")]
    TimedOut(Duration),

    /// The component cannot recover in-process.
    #[error("component marked unrecoverable")]
    Unrecoverable,

    #[error("no recovery actions registered for {0}")]
    NoActions(RecoveryStrategy),

    #[error("all recovery actions for {0} failed")]
    Exhausted(RecoveryStrategy),
}

type ActionFn = dyn Fn(RecoveryContext) -> BoxFuture<'static, Result<(), RecoveryError>> + Send + Sync;

/// Named remediation procedure with its own attempt budget.
#[derive(Clone)]
pub struct RecoveryAction {
    pub name: String,
    pub max_attempts: u32,
    pub delay_between_attempts: Duration,
    pub timeout: Option<Duration>,
    run: Arc<ActionFn>,
}

impl fmt::Debug for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryAction")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("delay_between_attempts", &self.delay_between_attempts)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RecoveryAction {
    /// Single-attempt action without timeout.
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(RecoveryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RecoveryError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            max_attempts: 1,
            delay_between_attempts: Duration::ZERO,
            timeout: None,
            run: Arc::new(move |ctx| run(ctx).boxed()),
        }
    }

    pub fn with_attempts(mut self, max_attempts: u32, delay_between_attempts: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.delay_between_attempts = delay_between_attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run_once(&self, ctx: RecoveryContext) -> Result<(), RecoveryError> {
        let fut = (self.run)(ctx);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or(Err(RecoveryError::TimedOut(limit))),
            None => fut.await,
        }
    }
}

/// Registry and executor of recovery actions.
#[derive(Debug, Default)]
pub struct RecoveryManager {
    actions: HashMap<RecoveryStrategy, Vec<RecoveryAction>>,
    unrecoverable: Arc<AtomicBool>,
}

impl RecoveryManager {
    /// Manager without any actions.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Manager with the built-in actions:
    /// `reset_connection` and `retry_with_pause` for `Retry`,
    /// `cool_down` for `CircuitBreak`, `mark_unrecoverable` for `Restart`.
    pub fn with_defaults(config: &ExceptionConfig) -> Self {
        let mut manager = Self::empty();
        let action_timeout = config.action_timeout();
        let retry_pause = config.retry_pause();
        let cool_down = config.cool_down();

        manager.register(
            RecoveryStrategy::Retry,
            RecoveryAction::new("reset_connection", |ctx: RecoveryContext| async move {
                let target = ctx.target.ok_or(RecoveryError::NotApplicable)?;
                tracing::info!(connection = %target.label(), "Resetting connection");
                target
                    .reconnect()
                    .await
                    .map_err(|e| RecoveryError::Failed(e.to_string()))
            })
            .with_attempts(2, retry_pause)
            .with_timeout(action_timeout),
        );

        manager.register(
            RecoveryStrategy::Retry,
            RecoveryAction::new("retry_with_pause", move |_ctx| async move {
                tokio::time::sleep(retry_pause).await;
                Ok(())
            })
            .with_timeout(action_timeout.max(retry_pause)),
        );

        manager.register(
            RecoveryStrategy::CircuitBreak,
            RecoveryAction::new("cool_down", move |ctx: RecoveryContext| async move {
                tracing::info!(
                    category = %ctx.classification.category,
                    pause = ?cool_down,
                    "Cooling down before resuming traffic"
                );
                tokio::time::sleep(cool_down).await;
                Ok(())
            }),
        );

        let flag = manager.unrecoverable.clone();
        manager.register(
            RecoveryStrategy::Restart,
            RecoveryAction::new("mark_unrecoverable", move |ctx: RecoveryContext| {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    tracing::error!(
                        category = %ctx.classification.category,
                        error = %ctx.message,
                        "Component marked unrecoverable; process restart required"
                    );
                    Err(RecoveryError::Unrecoverable)
                }
            }),
        );

        manager
    }

    /// Append an action to a strategy's chain.
    pub fn register(&mut self, strategy: RecoveryStrategy, action: RecoveryAction) {
        self.actions.entry(strategy).or_default().push(action);
    }

    pub fn actions(&self, strategy: RecoveryStrategy) -> &[RecoveryAction] {
        self.actions.get(&strategy).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.unrecoverable.load(Ordering::SeqCst)
    }

    /// Run the chain for `strategy`. Returns the name of the action that succeeded.
    pub async fn execute(&self, strategy: RecoveryStrategy, ctx: RecoveryContext) -> Result<String, RecoveryError> {
        if strategy == RecoveryStrategy::Ignore {
            return Ok(RecoveryStrategy::Ignore.as_str().to_string());
        }

        let actions = self.actions(strategy);
        if actions.is_empty() {
            return Err(RecoveryError::NoActions(strategy));
        }

        for action in actions {
            for attempt in 1..=action.max_attempts {
                match action.run_once(ctx.clone()).await {
                    Ok(()) => {
                        tracing::debug!(action = %action.name, attempt, "Recovery action succeeded");
                        return Ok(action.name.clone());
                    }
                    Err(RecoveryError::NotApplicable) => {
                        tracing::trace!(action = %action.name, "Recovery action not applicable");
                        break;
                    }
                    Err(RecoveryError::Unrecoverable) => return Err(RecoveryError::Unrecoverable),
                    Err(err) => {
                        tracing::warn!(
                            action = %action.name,
                            attempt,
                            max_attempts = action.max_attempts,
                            error = %err,
                            "Recovery action failed"
                        );
                        if attempt < action.max_attempts && !action.delay_between_attempts.is_zero() {
                            tokio::time::sleep(action.delay_between_attempts).await;
                        }
                    }
                }
            }
        }

        Err(RecoveryError::Exhausted(strategy))
    }
}
