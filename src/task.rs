//! Task capability trait and handles.

use async_trait::async_trait;
use serde_json::Value;

/// Unique handle for a task registered with an [`App`](crate::App).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub usize);

/// A dispatchable unit of work.
///
/// The engine treats a task purely through this capability: it is invoked
/// with the positional arguments routed to it and produces a single value.
/// What the task computes is irrelevant to the engine. Wiring state (joins,
/// batch membership) is owned by the [`App`](crate::App) registry, keyed by
/// the handle returned at registration.
#[async_trait]
pub trait Task: Send + Sync {
    /// Name used as the provenance key for values this task produces.
    fn name(&self) -> &str;

    /// Execute with the given positional arguments.
    ///
    /// Errors propagate uncaught: they abort the current run and surface to
    /// the caller. The engine never retries.
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value>;
}
