//! Parameter mapping: build a step's input from path expressions.
//!
//! A mapping binds target field names to JEXL expressions evaluated against
//! `{ input, steps, context, workflow }`. Values travel as evaluation context
//! only; mapping strings are never executed as code.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ContextView;
use crate::expression::{ExpressionError, WorkflowEvaluator};
use crate::step::{BoxStep, Step, StepContext, StepError, StepResult};

/// Target field -> expression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamMapping {
    fields: BTreeMap<String, String>,
}

impl ParamMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `target` to `expression`, e.g. `.map("sku", "input.product.sku")`.
    pub fn map(mut self, target: impl Into<String>, expression: impl Into<String>) -> Self {
        self.fields.insert(target.into(), expression.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Evaluate every binding into a JSON object.
    pub fn apply(
        &self,
        evaluator: &WorkflowEvaluator,
        input: &Value,
        view: &ContextView,
    ) -> Result<Value, ExpressionError> {
        let context = view.to_expression_context(input);
        let mut mapped = serde_json::Map::with_capacity(self.fields.len());
        for (target, expression) in &self.fields {
            let value = evaluator.evaluate_value(expression, &context)?;
            mapped.insert(target.clone(), value);
        }
        Ok(Value::Object(mapped))
    }
}

/// Step wrapper that feeds the inner step a mapped object instead of the
/// raw running data.
pub struct MappedStep {
    inner: BoxStep,
    mapping: ParamMapping,
    evaluator: Arc<WorkflowEvaluator>,
}

impl MappedStep {
    pub fn new(inner: BoxStep, mapping: ParamMapping) -> Self {
        Self {
            inner,
            mapping,
            evaluator: Arc::new(WorkflowEvaluator::new()),
        }
    }

    pub fn boxed(self) -> BoxStep {
        BoxStep::new(self)
    }
}

impl Step for MappedStep {
    async fn run(&self, input: Value, ctx: StepContext) -> StepResult {
        let mapped = self
            .mapping
            .apply(&self.evaluator, &input, &ctx.view)
            .map_err(|e| StepError::Failed(format!("parameter mapping failed: {e}")))?;
        self.inner.run(mapped, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CallerContext, ExecutionContext};
    use crate::step::step_fn;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn view() -> ContextView {
        let mut caller = CallerContext::new();
        caller.insert("market".to_string(), json!("DE"));
        let mut exec = ExecutionContext::new("research", Uuid::now_v7(), json!(null), caller);
        exec.record_result("lookup", json!({ "sku": "D-100", "price": 249.0 }));
        exec.view()
    }

    #[test]
    fn apply_builds_object_from_paths() {
        let mapping = ParamMapping::new()
            .map("sku", "steps.lookup.sku")
            .map("market", "context.market|lower")
            .map("query", "input.query");

        let out = mapping
            .apply(&WorkflowEvaluator::new(), &json!({ "query": "desk" }), &view())
            .unwrap();

        assert_eq!(out, json!({ "sku": "D-100", "market": "de", "query": "desk" }));
    }

    #[test]
    fn mapping_text_is_not_executed_from_data() {
        // Input that looks like an expression stays plain data.
        let mapping = ParamMapping::new().map("q", "input.q");
        let out = mapping
            .apply(&WorkflowEvaluator::new(), &json!({ "q": "steps.lookup.sku" }), &view())
            .unwrap();
        assert_eq!(out["q"], "steps.lookup.sku");
    }

    #[test]
    fn mapping_deserializes_from_plain_object() {
        let mapping: ParamMapping =
            serde_json::from_value(json!({ "sku": "steps.lookup.sku" })).unwrap();
        assert_eq!(mapping, ParamMapping::new().map("sku", "steps.lookup.sku"));
    }

    #[tokio::test]
    async fn mapped_step_receives_mapped_input() {
        let echo = step_fn(|input, _ctx| async move { Ok(input) });
        let step = MappedStep::new(echo, ParamMapping::new().map("price", "steps.lookup.price")).boxed();

        let ctx = StepContext {
            view: view(),
            step_id: "quote".to_string(),
            group_id: None,
            attempt: 1,
            cancel: CancellationToken::new(),
        };
        let out = step.run(json!("ignored"), ctx).await.unwrap();
        assert_eq!(out, json!({ "price": 249.0 }));
    }

    #[tokio::test]
    async fn broken_mapping_fails_the_step() {
        let echo = step_fn(|input, _ctx| async move { Ok(input) });
        let step = MappedStep::new(echo, ParamMapping::new().map("x", "input.(")).boxed();
        let ctx = StepContext {
            view: view(),
            step_id: "quote".to_string(),
            group_id: None,
            attempt: 1,
            cancel: CancellationToken::new(),
        };
        let err = step.run(json!({}), ctx).await.unwrap_err();
        assert!(err.to_string().contains("parameter mapping failed"));
    }
}
