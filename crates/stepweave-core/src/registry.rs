//! Step, group and workflow registries.
//!
//! Registration is synchronous and happens mostly at startup; execution only
//! reads. Step-scoped tables are `DashMap`s. Workflows live in one ordered
//! table so `list_workflows` reports registration order.

use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use serde_json::Value;
use stepweave_types::workflow::{SequenceEntry, WorkflowKind, WorkflowSummary};

use crate::condition::Condition;
use crate::context::CallerContext;
use crate::retry::RetryPolicy;
use crate::step::BoxStep;

/// Computes a dynamic workflow's sequence from `(initial_data, caller_context)`.
pub type ResolverFn =
    Arc<dyn Fn(&Value, &CallerContext) -> anyhow::Result<Vec<String>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("workflow '{0}' is already registered")]
    DuplicateWorkflow(String),

    #[error("'{0}' is already registered as a step")]
    NamespaceConflict(String),

    #[error("parallel group '{0}' has no members")]
    EmptyGroup(String),

    #[error("resolver for workflow '{workflow_id}' failed: {message}")]
    Resolver { workflow_id: String, message: String },
}

#[derive(Clone)]
enum WorkflowDef {
    /// Raw ids, classified as step or group at execution time.
    Raw(Vec<String>),
    Entries(Vec<SequenceEntry>),
    Dynamic(ResolverFn),
}

/// Process-wide registry of steps, policies, conditions, groups and workflows.
#[derive(Default)]
pub struct WorkflowRegistry {
    steps: DashMap<String, BoxStep>,
    retry_policies: DashMap<String, RetryPolicy>,
    conditions: DashMap<String, Condition>,
    groups: DashMap<String, Vec<String>>,
    workflows: RwLock<Vec<(String, WorkflowDef)>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Register a step. Re-registering an id replaces the previous step.
    pub fn register_step(&self, id: impl Into<String>, step: BoxStep) {
        let id = id.into();
        if self.steps.insert(id.clone(), step).is_some() {
            tracing::warn!(step_id = id.as_str(), "step re-registered, previous binding replaced");
        } else {
            tracing::debug!(step_id = id.as_str(), "registered step");
        }
    }

    pub fn configure_retry(&self, id: &str, policy: RetryPolicy) -> Result<(), RegistryError> {
        self.require_step(id)?;
        self.retry_policies.insert(id.to_string(), policy);
        Ok(())
    }

    pub fn set_condition(&self, id: &str, condition: Condition) -> Result<(), RegistryError> {
        self.require_step(id)?;
        self.conditions.insert(id.to_string(), condition);
        Ok(())
    }

    pub fn has_step(&self, id: &str) -> bool {
        self.steps.contains_key(id)
    }

    pub fn step(&self, id: &str) -> Option<BoxStep> {
        self.steps.get(id).map(|s| s.value().clone())
    }

    pub fn retry_policy(&self, id: &str) -> Option<RetryPolicy> {
        self.retry_policies.get(id).map(|p| p.value().clone())
    }

    pub fn condition(&self, id: &str) -> Option<Condition> {
        self.conditions.get(id).map(|c| c.value().clone())
    }

    fn require_step(&self, id: &str) -> Result<(), RegistryError> {
        if self.has_step(id) {
            Ok(())
        } else {
            Err(RegistryError::UnknownStep(id.to_string()))
        }
    }

    // -----------------------------------------------------------------------
    // Parallel groups
    // -----------------------------------------------------------------------

    /// Register a parallel group over already-registered steps.
    pub fn register_parallel_group<I, S>(&self, id: impl Into<String>, members: I) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        let members: Vec<String> = members.into_iter().map(Into::into).collect();

        if members.is_empty() {
            return Err(RegistryError::EmptyGroup(id));
        }
        if let Some(missing) = members.iter().find(|m| !self.has_step(m)) {
            return Err(RegistryError::UnknownStep(missing.clone()));
        }
        if self.has_step(&id) {
            return Err(RegistryError::NamespaceConflict(id));
        }

        tracing::debug!(group_id = id.as_str(), members = members.len(), "registered parallel group");
        self.groups.insert(id, members);
        Ok(())
    }

    pub fn group_members(&self, id: &str) -> Option<Vec<String>> {
        self.groups.get(id).map(|m| m.value().clone())
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Register a static workflow over raw step/group ids.
    ///
    /// Ids are classified when the workflow executes; groups take precedence.
    pub fn register_workflow<I, S>(&self, id: impl Into<String>, sequence: I) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sequence = sequence.into_iter().map(Into::into).collect();
        self.insert_workflow(id.into(), WorkflowDef::Raw(sequence))
    }

    /// Register a static workflow with explicitly tagged entries.
    pub fn register_workflow_entries(
        &self,
        id: impl Into<String>,
        entries: Vec<SequenceEntry>,
    ) -> Result<(), RegistryError> {
        self.insert_workflow(id.into(), WorkflowDef::Entries(entries))
    }

    /// Register a workflow whose sequence is computed once per execution.
    pub fn register_dynamic_workflow<F>(&self, id: impl Into<String>, resolver: F) -> Result<(), RegistryError>
    where
        F: Fn(&Value, &CallerContext) -> anyhow::Result<Vec<String>> + Send + Sync + 'static,
    {
        self.insert_workflow(id.into(), WorkflowDef::Dynamic(Arc::new(resolver)))
    }

    fn insert_workflow(&self, id: String, def: WorkflowDef) -> Result<(), RegistryError> {
        let mut workflows = self.workflows.write().unwrap_or_else(PoisonError::into_inner);
        if workflows.iter().any(|(existing, _)| *existing == id) {
            return Err(RegistryError::DuplicateWorkflow(id));
        }
        tracing::debug!(workflow = id.as_str(), "registered workflow");
        workflows.push((id, def));
        Ok(())
    }

    fn workflow(&self, id: &str) -> Option<WorkflowDef> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, def)| def.clone())
    }

    pub fn has_workflow(&self, id: &str) -> bool {
        self.workflow(id).is_some()
    }

    /// Static and dynamic workflow ids, in registration order.
    pub fn list_workflows(&self) -> Vec<String> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn workflow_summaries(&self) -> Vec<WorkflowSummary> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, def)| {
                let (kind, sequence) = match def {
                    WorkflowDef::Raw(ids) => (WorkflowKind::Static, ids.clone()),
                    WorkflowDef::Entries(entries) => (
                        WorkflowKind::Static,
                        entries.iter().map(|e| e.id().to_string()).collect(),
                    ),
                    WorkflowDef::Dynamic(_) => (WorkflowKind::Dynamic, Vec::new()),
                };
                WorkflowSummary {
                    id: id.clone(),
                    kind,
                    sequence,
                }
            })
            .collect()
    }

    /// Resolve a workflow's sequence for one execution.
    ///
    /// Dynamic resolvers run exactly once per call.
    pub fn resolve_sequence(
        &self,
        workflow_id: &str,
        input: &Value,
        caller_context: &CallerContext,
    ) -> Result<Vec<SequenceEntry>, RegistryError> {
        let def = self
            .workflow(workflow_id)
            .ok_or_else(|| RegistryError::UnknownWorkflow(workflow_id.to_string()))?;

        match def {
            WorkflowDef::Raw(ids) => ids.iter().map(|id| self.classify(id)).collect(),
            WorkflowDef::Entries(entries) => {
                for entry in &entries {
                    let known = match entry {
                        SequenceEntry::Step(id) => self.has_step(id),
                        SequenceEntry::Group(id) => self.groups.contains_key(id),
                    };
                    if !known {
                        return Err(RegistryError::UnknownStep(entry.id().to_string()));
                    }
                }
                Ok(entries)
            }
            WorkflowDef::Dynamic(resolver) => {
                let ids = resolver(input, caller_context).map_err(|e| RegistryError::Resolver {
                    workflow_id: workflow_id.to_string(),
                    message: format!("{e:#}"),
                })?;
                tracing::debug!(workflow = workflow_id, entries = ids.len(), "resolved dynamic sequence");
                ids.iter().map(|id| self.classify(id)).collect()
            }
        }
    }

    fn classify(&self, id: &str) -> Result<SequenceEntry, RegistryError> {
        if self.groups.contains_key(id) {
            Ok(SequenceEntry::Group(id.to_string()))
        } else if self.has_step(id) {
            Ok(SequenceEntry::Step(id.to_string()))
        } else {
            Err(RegistryError::UnknownStep(id.to_string()))
        }
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("steps", &self.steps.len())
            .field("groups", &self.groups.len())
            .field("workflows", &self.list_workflows())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::step_fn;
    use serde_json::json;

    fn noop() -> BoxStep {
        step_fn(|input, _ctx| async move { Ok(input) })
    }

    fn registry_with(steps: &[&str]) -> WorkflowRegistry {
        let registry = WorkflowRegistry::new();
        for id in steps {
            registry.register_step(*id, noop());
        }
        registry
    }

    #[test]
    fn configure_retry_and_condition_need_known_step() {
        let registry = registry_with(&["a"]);
        assert!(registry.configure_retry("a", RetryPolicy::no_retry()).is_ok());
        assert_eq!(registry.retry_policy("a").unwrap().max_retries, 0);
        assert_eq!(
            registry.configure_retry("zz", RetryPolicy::default()),
            Err(RegistryError::UnknownStep("zz".to_string()))
        );
        assert_eq!(
            registry.set_condition("zz", Condition::expression("true")).unwrap_err(),
            RegistryError::UnknownStep("zz".to_string())
        );
        assert!(registry.set_condition("a", Condition::expression("true")).is_ok());
        assert!(registry.condition("a").is_some());
    }

    #[tokio::test]
    async fn reregistering_step_overwrites() {
        let registry = WorkflowRegistry::new();
        registry.register_step("a", step_fn(|_input, _ctx| async { Ok(json!("first")) }));
        registry.register_step("a", step_fn(|_input, _ctx| async { Ok(json!("second")) }));
        assert!(format!("{registry:?}").contains("steps: 1"));

        let exec = crate::context::ExecutionContext::new(
            "w",
            uuid::Uuid::now_v7(),
            json!(null),
            CallerContext::new(),
        );
        let ctx = crate::step::StepContext {
            view: exec.view(),
            step_id: "a".to_string(),
            group_id: None,
            attempt: 1,
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        let output = registry.step("a").unwrap().run(json!(null), ctx).await.unwrap();
        assert_eq!(output, json!("second"));
    }

    #[test]
    fn group_validation() {
        let registry = registry_with(&["a", "b"]);

        assert_eq!(
            registry.register_parallel_group("g", ["a", "x", "y"]),
            Err(RegistryError::UnknownStep("x".to_string()))
        );
        assert_eq!(
            registry.register_parallel_group("g", Vec::<String>::new()),
            Err(RegistryError::EmptyGroup("g".to_string()))
        );
        assert_eq!(
            registry.register_parallel_group("a", ["b"]),
            Err(RegistryError::NamespaceConflict("a".to_string()))
        );

        registry.register_parallel_group("g", ["a", "b"]).unwrap();
        assert_eq!(registry.group_members("g").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn duplicate_workflow_keeps_first_definition() {
        let registry = registry_with(&["a", "b"]);
        registry.register_workflow("w", ["a"]).unwrap();

        assert_eq!(
            registry.register_workflow("w", ["b"]),
            Err(RegistryError::DuplicateWorkflow("w".to_string()))
        );
        assert_eq!(
            registry.register_dynamic_workflow("w", |_, _| Ok(vec!["b".to_string()])),
            Err(RegistryError::DuplicateWorkflow("w".to_string()))
        );

        let seq = registry.resolve_sequence("w", &json!(null), &CallerContext::new()).unwrap();
        assert_eq!(seq, vec![SequenceEntry::Step("a".to_string())]);
    }

    #[test]
    fn list_workflows_in_registration_order() {
        let registry = registry_with(&["a"]);
        registry.register_workflow("second", ["a"]).unwrap();
        registry.register_dynamic_workflow("first", |_, _| Ok(Vec::new())).unwrap();
        registry
            .register_workflow_entries("third", vec![SequenceEntry::Step("a".to_string())])
            .unwrap();

        assert_eq!(registry.list_workflows(), vec!["second", "first", "third"]);

        let summaries = registry.workflow_summaries();
        assert_eq!(summaries[1].kind, WorkflowKind::Dynamic);
        assert!(summaries[1].sequence.is_empty());
        assert_eq!(summaries[2].sequence, vec!["a"]);
    }

    #[test]
    fn raw_ids_prefer_groups_and_are_validated_lazily() {
        let registry = registry_with(&["a", "b"]);
        registry.register_parallel_group("g", ["a", "b"]).unwrap();
        registry.register_workflow("w", ["a", "g", "later"]).unwrap();

        assert_eq!(
            registry.resolve_sequence("w", &json!(null), &CallerContext::new()),
            Err(RegistryError::UnknownStep("later".to_string()))
        );

        registry.register_step("later", noop());
        let seq = registry.resolve_sequence("w", &json!(null), &CallerContext::new()).unwrap();
        assert_eq!(
            seq,
            vec![
                SequenceEntry::Step("a".to_string()),
                SequenceEntry::Group("g".to_string()),
                SequenceEntry::Step("later".to_string()),
            ]
        );
    }

    #[test]
    fn explicit_entries_must_exist() {
        let registry = registry_with(&["a"]);
        registry
            .register_workflow_entries("w", vec![SequenceEntry::Group("a".to_string())])
            .unwrap();
        assert_eq!(
            registry.resolve_sequence("w", &json!(null), &CallerContext::new()),
            Err(RegistryError::UnknownStep("a".to_string()))
        );
    }

    #[test]
    fn dynamic_resolver_uses_input_and_context() {
        let registry = registry_with(&["cheap", "deep"]);
        registry
            .register_dynamic_workflow("adaptive", |input, ctx| {
                let mut seq = vec!["cheap".to_string()];
                if input["thorough"].as_bool().unwrap_or(false) || ctx.contains_key("vip") {
                    seq.push("deep".to_string());
                }
                Ok(seq)
            })
            .unwrap();

        let quick = registry
            .resolve_sequence("adaptive", &json!({}), &CallerContext::new())
            .unwrap();
        assert_eq!(quick.len(), 1);

        let thorough = registry
            .resolve_sequence("adaptive", &json!({ "thorough": true }), &CallerContext::new())
            .unwrap();
        assert_eq!(thorough.len(), 2);
    }

    #[test]
    fn resolver_failure_and_unknown_workflow() {
        let registry = registry_with(&[]);
        registry
            .register_dynamic_workflow("broken", |_, _| anyhow::bail!("no plan for input"))
            .unwrap();

        match registry.resolve_sequence("broken", &json!(null), &CallerContext::new()) {
            Err(RegistryError::Resolver { workflow_id, message }) => {
                assert_eq!(workflow_id, "broken");
                assert!(message.contains("no plan"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(
            registry.resolve_sequence("nope", &json!(null), &CallerContext::new()),
            Err(RegistryError::UnknownWorkflow("nope".to_string()))
        );
    }
}
