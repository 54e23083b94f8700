//! Task handler trait and function adapters.

use crate::core::TaskOutcome;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::future::Future;

/// The work a stage performs for each input.
///
/// Returning `Err` is equivalent to returning [`TaskOutcome::Error`].
#[async_trait]
pub trait TaskHandler: Send + Sync + Debug {
    /// Returns the handler name, used in logs.
    fn name(&self) -> &str;

    /// Runs the task.
    ///
    /// # Arguments
    ///
    /// * `input` - The decoded message value, or the run arguments for a
    ///   source stage
    async fn handle(&self, input: Value) -> anyhow::Result<TaskOutcome>;
}

/// A handler backed by a synchronous function.
pub struct FnHandler<F>
where
    F: Fn(Value) -> anyhow::Result<TaskOutcome> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(Value) -> anyhow::Result<TaskOutcome> + Send + Sync,
{
    /// Creates a new function-based handler.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnHandler<F>
where
    F: Fn(Value) -> anyhow::Result<TaskOutcome> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(Value) -> anyhow::Result<TaskOutcome> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, input: Value) -> anyhow::Result<TaskOutcome> {
        (self.func)(input)
    }
}

/// A handler backed by an async function.
pub struct AsyncFnHandler<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<TaskOutcome>> + Send,
{
    name: String,
    func: F,
    _phantom: std::marker::PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnHandler<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<TaskOutcome>> + Send,
{
    /// Creates a new async function-based handler.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<F, Fut> Debug for AsyncFnHandler<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<TaskOutcome>> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFnHandler")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for AsyncFnHandler<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<TaskOutcome>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, input: Value) -> anyhow::Result<TaskOutcome> {
        (self.func)(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = FnHandler::new("double", |v| {
            let n = v.as_i64().ok_or_else(|| anyhow::anyhow!("not a number"))?;
            Ok(TaskOutcome::value(n * 2))
        });

        assert_eq!(handler.name(), "double");
        let outcome = handler.handle(json!(21)).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Value(v) if v == json!(42)));
        assert!(handler.handle(json!("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_async_fn_handler() {
        let handler = AsyncFnHandler::new("echo", |v| async move { Ok(TaskOutcome::Value(v)) });

        let outcome = handler.handle(json!({"k": 1})).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Value(v) if v == json!({"k": 1})));
        assert!(format!("{handler:?}").contains("echo"));
    }
}
