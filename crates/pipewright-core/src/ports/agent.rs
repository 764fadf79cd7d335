//! AgentRunner port and its type-erased wrapper.

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors reported by an agent runner.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent ran but could not produce a result.
    #[error("{0}")]
    Execution(String),

    /// The agent stopped because its cancellation token fired.
    #[error("agent call cancelled")]
    Cancelled,
}

/// Executes prompts against an agent.
///
/// `session_key` is stable for a given workflow step slot, so repeated
/// invocations of the same step may share session-scoped memory. `cancel`
/// fires when the owning run is cancelled; honoring it is optional.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
pub trait AgentRunner: Send + Sync {
    fn run(
        &self,
        session_key: &str,
        prompt: &str,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<String, AgentError>> + Send;
}

/// Object-safe version of [`AgentRunner`] with boxed futures.
///
/// A blanket implementation is provided for all types implementing `AgentRunner`.
pub trait AgentRunnerDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        session_key: &'a str,
        prompt: &'a str,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<String, AgentError>>;
}

impl<T: AgentRunner> AgentRunnerDyn for T {
    fn run_boxed<'a>(
        &'a self,
        session_key: &'a str,
        prompt: &'a str,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<String, AgentError>> {
        Box::pin(self.run(session_key, prompt, cancel))
    }
}

/// Type-erased agent runner injected into the engine at construction.
pub struct BoxAgentRunner {
    inner: Box<dyn AgentRunnerDyn>,
}

impl BoxAgentRunner {
    pub fn new<T: AgentRunner + 'static>(runner: T) -> Self {
        Self {
            inner: Box::new(runner),
        }
    }

    pub async fn run(
        &self,
        session_key: &str,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<String, AgentError> {
        self.inner.run_boxed(session_key, prompt, cancel).await
    }
}
