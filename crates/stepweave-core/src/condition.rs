//! Step conditions.
//!
//! A condition is evaluated immediately before its step (or its group) runs,
//! against the data current at that point. A false condition skips the step;
//! it never fails the run. Expression errors do.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::context::ContextView;
use crate::expression::{ExpressionError, WorkflowEvaluator};

/// Async predicate over `(data, snapshot)`.
pub type PredicateFn = Arc<dyn Fn(Value, ContextView) -> BoxFuture<'static, bool> + Send + Sync>;

#[derive(Clone)]
pub enum Condition {
    Predicate(PredicateFn),
    /// JEXL expression over `{ input, steps, context, workflow }`.
    Expression(String),
}

impl Condition {
    /// Synchronous predicate.
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&Value, &ContextView) -> bool + Send + Sync + 'static,
    {
        Condition::Predicate(Arc::new(move |data, view| {
            let keep = predicate(&data, &view);
            Box::pin(async move { keep })
        }))
    }

    pub fn when_async<F, Fut>(predicate: F) -> Self
    where
        F: Fn(Value, ContextView) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Condition::Predicate(Arc::new(move |data, view| Box::pin(predicate(data, view))))
    }

    pub fn expression(expression: impl Into<String>) -> Self {
        Condition::Expression(expression.into())
    }

    /// Returns whether the guarded step should run.
    pub async fn evaluate(
        &self,
        data: &Value,
        view: &ContextView,
        evaluator: &WorkflowEvaluator,
    ) -> Result<bool, ExpressionError> {
        match self {
            Condition::Predicate(predicate) => Ok(predicate(data.clone(), view.clone()).await),
            Condition::Expression(expression) => evaluator.evaluate_condition(expression, data, view),
        }
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::Predicate(_) => f.write_str("Condition::Predicate(..)"),
            Condition::Expression(expr) => f.debug_tuple("Condition::Expression").field(expr).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CallerContext, ExecutionContext};
    use serde_json::json;
    use uuid::Uuid;

    fn view() -> ContextView {
        let mut ctx = CallerContext::new();
        ctx.insert("plan".to_string(), json!("pro"));
        let mut exec = ExecutionContext::new("wf", Uuid::now_v7(), json!(null), ctx);
        exec.record_result("fetch", json!({ "in_stock": true }));
        exec.view()
    }

    #[tokio::test]
    async fn sync_predicate() {
        let cond = Condition::when(|data, _| data.as_i64().is_some_and(|n| n > 3));
        let eval = WorkflowEvaluator::new();
        assert!(cond.evaluate(&json!(5), &view(), &eval).await.unwrap());
        assert!(!cond.evaluate(&json!(1), &view(), &eval).await.unwrap());
    }

    #[tokio::test]
    async fn async_predicate_sees_results() {
        let cond = Condition::when_async(|_data, view: ContextView| async move {
            tokio::task::yield_now().await;
            view.result("fetch").and_then(|v| v["in_stock"].as_bool()).unwrap_or(false)
        });
        let eval = WorkflowEvaluator::new();
        assert!(cond.evaluate(&json!(null), &view(), &eval).await.unwrap());
    }

    #[tokio::test]
    async fn expression_condition() {
        let eval = WorkflowEvaluator::new();
        let yes = Condition::expression("context.plan == 'pro' && steps.fetch.in_stock");
        let no = Condition::expression("context.plan == 'free'");
        assert!(yes.evaluate(&json!(null), &view(), &eval).await.unwrap());
        assert!(!no.evaluate(&json!(null), &view(), &eval).await.unwrap());
        assert!(format!("{no:?}").contains("free"));
    }

    #[tokio::test]
    async fn broken_expression_is_an_error() {
        let eval = WorkflowEvaluator::new();
        let cond = Condition::expression("steps.(");
        assert!(cond.evaluate(&json!(null), &view(), &eval).await.is_err());
    }
}
