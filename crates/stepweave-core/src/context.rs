//! Per-invocation execution context.
//!
//! An `ExecutionContext` is created for every `execute_workflow` call and
//! dropped when the call returns; concurrent runs of the same workflow never
//! share one. Steps and conditions see an immutable [`ContextView`] snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

/// Free-form metadata supplied by the caller (request id, user, locale...).
pub type CallerContext = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable accumulator for one workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    workflow_id: String,
    execution_id: Uuid,
    initial_data: Value,
    accumulated_results: HashMap<String, Value>,
    caller_context: Arc<CallerContext>,
}

impl ExecutionContext {
    pub fn new(
        workflow_id: impl Into<String>,
        execution_id: Uuid,
        initial_data: Value,
        caller_context: CallerContext,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id,
            initial_data,
            accumulated_results: HashMap::new(),
            caller_context: Arc::new(caller_context),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn initial_data(&self) -> &Value {
        &self.initial_data
    }

    /// Store the output of a completed step or group.
    pub fn record_result(&mut self, id: &str, output: Value) {
        self.accumulated_results.insert(id.to_string(), output);
    }

    pub fn result(&self, id: &str) -> Option<&Value> {
        self.accumulated_results.get(id)
    }

    pub fn results(&self) -> &HashMap<String, Value> {
        &self.accumulated_results
    }

    pub fn into_results(self) -> HashMap<String, Value> {
        self.accumulated_results
    }

    /// Immutable snapshot of the run as it stands now.
    pub fn view(&self) -> ContextView {
        ContextView {
            workflow_id: self.workflow_id.clone(),
            execution_id: self.execution_id,
            results: Arc::new(self.accumulated_results.clone()),
            caller_context: Arc::clone(&self.caller_context),
        }
    }
}

// ---------------------------------------------------------------------------
// ContextView
// ---------------------------------------------------------------------------

/// Read-only snapshot handed to steps and conditions.
#[derive(Debug, Clone)]
pub struct ContextView {
    pub workflow_id: String,
    pub execution_id: Uuid,
    pub results: Arc<HashMap<String, Value>>,
    pub caller_context: Arc<CallerContext>,
}

impl ContextView {
    pub fn result(&self, id: &str) -> Option<&Value> {
        self.results.get(id)
    }

    /// Build the JSON object that expressions evaluate against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "input": <current data>,
    ///   "steps": { "<id>": <output>, ... },
    ///   "context": { <caller context> },
    ///   "workflow": { "id": "...", "execution_id": "..." }
    /// }
    /// ```
    pub fn to_expression_context(&self, input: &Value) -> Value {
        let steps: serde_json::Map<String, Value> = self
            .results
            .iter()
            .map(|(id, output)| (id.clone(), output.clone()))
            .collect();

        json!({
            "input": input,
            "steps": steps,
            "context": Value::Object((*self.caller_context).clone()),
            "workflow": {
                "id": self.workflow_id,
                "execution_id": self.execution_id.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller() -> CallerContext {
        let mut ctx = CallerContext::new();
        ctx.insert("user".to_string(), json!("ana"));
        ctx
    }

    #[test]
    fn results_accumulate_per_invocation() {
        let mut a = ExecutionContext::new("wf", Uuid::now_v7(), json!(1), caller());
        let b = ExecutionContext::new("wf", Uuid::now_v7(), json!(2), caller());

        a.record_result("fetch", json!({ "price": 10 }));

        assert_eq!(a.result("fetch"), Some(&json!({ "price": 10 })));
        assert!(b.results().is_empty());
        assert_eq!(b.initial_data(), &json!(2));
    }

    #[test]
    fn view_is_a_snapshot() {
        let mut ctx = ExecutionContext::new("wf", Uuid::now_v7(), json!(null), caller());
        ctx.record_result("a", json!(1));
        let view = ctx.view();
        ctx.record_result("b", json!(2));

        assert_eq!(view.result("a"), Some(&json!(1)));
        assert!(view.result("b").is_none());
        assert_eq!(ctx.into_results().len(), 2);
    }

    #[test]
    fn expression_context_shape() {
        let id = Uuid::now_v7();
        let mut ctx = ExecutionContext::new("research", id, json!(null), caller());
        ctx.record_result("fetch", json!({ "price": 10 }));

        let expr = ctx.view().to_expression_context(&json!({ "sku": "x1" }));
        assert_eq!(expr["input"]["sku"], "x1");
        assert_eq!(expr["steps"]["fetch"]["price"], 10);
        assert_eq!(expr["context"]["user"], "ana");
        assert_eq!(expr["workflow"]["id"], "research");
        assert_eq!(expr["workflow"]["execution_id"], id.to_string());
    }
}
