//! Step handler contract and registry.
//!
//! Handlers are host code: the engine resolves a step's opaque handler
//! identifier against the registry, invokes it with the assembled input,
//! and records the outcome. Handlers convert their native errors into
//! [`HandlerFailure`] at this boundary; an explicit class bypasses the
//! classifier, otherwise the failure message is classified by marker.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::classify::ErrorClass;

// =============================================================================
// Cancellation
// =============================================================================

/// Receiver half of a cancellation signal. Handlers observe it; the engine
/// fires it on timeout and execution cancel.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation fires. Also resolves if the engine side
    /// is dropped, which only happens after the attempt settled.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Sender half, held by the step runner.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

pub fn cancel_channel() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

// =============================================================================
// Handler contract
// =============================================================================

/// Everything a handler may know about the attempt it runs in.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub tenant_id: String,
    pub execution_id: Uuid,
    pub step_code: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Hard deadline for this attempt; the engine marks the attempt failed
    /// when it passes.
    pub deadline: DateTime<Utc>,
    pub cancellation: CancelSignal,
}

/// A handler failure crossing back into the engine.
///
/// `class: None` means "classify my message"; an explicit class wins.
/// [`HandlerFailure::compensation_required`] is the only way the
/// `COMPENSATION_REQUIRED` class enters the system.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub class: Option<ErrorClass>,
    pub message: String,
}

impl HandlerFailure {
    /// A failure to be classified from its message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            class: None,
            message: message.into(),
        }
    }

    /// A failure with an explicit class.
    pub fn with_class(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class: Some(class),
            message: message.into(),
        }
    }

    /// The step left partial, externally visible side effects behind.
    pub fn compensation_required(message: impl Into<String>) -> Self {
        Self::with_class(ErrorClass::CompensationRequired, message)
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            Some(class) => write!(f, "{}: {}", class, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for HandlerFailure {}

impl From<anyhow::Error> for HandlerFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// A step handler. `input` is the merged outputs of the step's
/// dependencies keyed by their codes, plus the execution input under
/// `$input`.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: HandlerContext, input: Value) -> Result<Value, HandlerFailure>;
}

/// Adapter so plain async closures can act as handlers.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerFailure>> + Send,
{
    async fn run(&self, ctx: HandlerContext, input: Value) -> Result<Value, HandlerFailure> {
        (self.0)(ctx, input).await
    }
}

/// Wrap an async closure as a registrable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerFailure>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// =============================================================================
// Registry
// =============================================================================

/// Maps handler codes to handlers. Wired once at startup by the host.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a code.
    ///
    /// # Panics
    ///
    /// Panics if the code is already taken; wiring is a startup concern
    /// and duplicate registration is a bug.
    pub fn register(&mut self, code: impl Into<String>, handler: Arc<dyn StepHandler>) {
        let code = code.into();
        if self.handlers.contains_key(&code) {
            panic!("handler already registered for code: {code}");
        }
        self.handlers.insert(code, handler);
    }

    pub fn lookup(&self, code: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(code).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("codes", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_handler_runs() {
        let handler = handler_fn(|_ctx, input| async move { Ok(json!({"echo": input})) });
        let (_handle, cancellation) = cancel_channel();
        let ctx = HandlerContext {
            tenant_id: "t".into(),
            execution_id: Uuid::new_v4(),
            step_code: "s".into(),
            attempt: 1,
            deadline: Utc::now(),
            cancellation,
        };
        let out = handler.run(ctx, json!(5)).await.unwrap();
        assert_eq!(out, json!({"echo": 5}));
    }

    #[tokio::test]
    async fn test_cancel_signal_fires() {
        let (handle, mut signal) = cancel_channel();
        assert!(!signal.is_cancelled());
        handle.cancel();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register("mail.welcome", handler_fn(|_c, _i| async { Ok(json!({})) }));
        assert!(registry.lookup("mail.welcome").is_some());
        assert!(registry.lookup("mail.goodbye").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_registration_panics() {
        let mut registry = HandlerRegistry::new();
        registry.register("x", handler_fn(|_c, _i| async { Ok(json!({})) }));
        registry.register("x", handler_fn(|_c, _i| async { Ok(json!({})) }));
    }

    #[test]
    fn test_failure_from_anyhow_has_no_class() {
        let failure: HandlerFailure = anyhow::anyhow!("connection reset").into();
        assert!(failure.class.is_none());
        assert!(failure.message.contains("connection reset"));
    }
}
