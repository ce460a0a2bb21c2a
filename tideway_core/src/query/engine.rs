use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

/// External collaborator that executes compiled query expressions.
///
/// The execution engine for the query language lives outside this crate;
/// connectors wire in whichever implementation their runtime provides.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Validate that `expr` parses. Mapping build surfaces failures here
    /// immediately as configuration errors, instead of deferring them to
    /// per-item evaluation.
    fn compile(&self, expr: &str) -> Result<()>;

    /// Evaluate `expr` against `document`, returning the resulting value.
    async fn evaluate(&self, document: &Value, expr: &str) -> Result<Value>;

    /// Evaluate `expr` against `document`, requiring a boolean result.
    async fn evaluate_bool(&self, document: &Value, expr: &str) -> Result<bool>;
}
