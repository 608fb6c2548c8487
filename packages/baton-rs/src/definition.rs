//! Workflow definitions: versioned, immutable-once-published step graphs.
//!
//! Definitions enter the engine as JSON through a narrow typed parser;
//! untyped maps never travel further than this module. Validation proves
//! the step graph is acyclic, every reference resolves, and the schemas
//! parse, so the orchestrator can assume a well-formed graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::classify::{ClassifierRule, ErrorClass};
use crate::error::Error;
use crate::retry::{
    default_backoff, default_max_attempts, default_retries, Backoff, DEFAULT_STEP_TIMEOUT_MS,
};
use crate::schema::Schema;

/// Lifecycle of a definition row. Published rows are immutable; a new
/// version clones and mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Published,
    Deprecated,
}

impl DefinitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefinitionStatus::Draft => "draft",
            DefinitionStatus::Published => "published",
            DefinitionStatus::Deprecated => "deprecated",
        }
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDescriptor {
    /// Unique within the workflow.
    pub code: String,
    /// Opaque handler identifier resolved against the host's registry.
    pub handler: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub compensation_handler: Option<String>,
    /// Classes worth retrying. When absent the per-class defaults apply.
    #[serde(default)]
    pub retry_on: Option<BTreeSet<ErrorClass>>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Option<Backoff>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Ordered marker list consulted before the default classifier.
    #[serde(default)]
    pub classifier_overrides: Vec<ClassifierRule>,
    /// When false the step runs at most once, whatever the other fields
    /// say.
    #[serde(default = "default_true")]
    pub safe_to_retry: bool,
}

fn default_true() -> bool {
    true
}

impl StepDescriptor {
    pub fn effective_timeout_ms(&self, policies: &DefinitionPolicies) -> u64 {
        self.timeout_ms
            .or(policies.default_timeout_ms)
            .unwrap_or(DEFAULT_STEP_TIMEOUT_MS)
    }

    /// Whether this class is ever retried for this step.
    pub fn retries(&self, class: ErrorClass) -> bool {
        if !self.safe_to_retry {
            return false;
        }
        match &self.retry_on {
            Some(classes) => classes.contains(&class),
            None => default_retries(class),
        }
    }

    pub fn max_attempts_for(&self, class: ErrorClass) -> u32 {
        if !self.safe_to_retry {
            return 1;
        }
        match self.max_attempts {
            Some(n) => n.max(1),
            None => default_max_attempts(class),
        }
    }

    /// Retry decision after `attempt` (1-based) failed with `class`.
    pub fn should_retry(&self, class: ErrorClass, attempt: u32) -> bool {
        self.retries(class) && attempt < self.max_attempts_for(class)
    }

    pub fn backoff_for(&self, class: ErrorClass) -> Backoff {
        self.backoff.clone().unwrap_or_else(|| default_backoff(class))
    }
}

/// Workflow-wide defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DefinitionPolicies {
    pub default_timeout_ms: Option<u64>,
    pub default_backoff: Option<Backoff>,
    /// Advisory cap on concurrent executions per tenant; enforced by the
    /// host's scheduler, recorded here so it versions with the graph.
    pub max_concurrency: Option<u32>,
}

/// The JSON shape a definition is published from.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefinitionSpec {
    pub code: String,
    pub steps: Vec<StepDescriptor>,
    #[serde(default)]
    pub policies: DefinitionPolicies,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    /// Closed projection from step outputs to the execution output:
    /// output key to step code.
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
}

/// A validated, versioned workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub tenant_id: String,
    pub code: String,
    /// Monotonic per `(tenant_id, code)`.
    pub version: i32,
    pub status: DefinitionStatus,
    pub steps: Vec<StepDescriptor>,
    pub policies: DefinitionPolicies,
    pub input_schema: Option<Schema>,
    pub output_schema: Option<Schema>,
    pub output_mapping: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl WorkflowDefinition {
    /// Validate a spec and build the definition row for `version`.
    pub fn from_spec(
        tenant_id: &str,
        spec: DefinitionSpec,
        version: i32,
        now: DateTime<Utc>,
    ) -> Result<Self, Error> {
        if spec.code.trim().is_empty() {
            return Err(Error::BadDefinition("code is required".into()));
        }
        if spec.steps.is_empty() {
            return Err(Error::BadDefinition("at least one step is required".into()));
        }

        let mut steps = spec.steps;
        let mut seen = BTreeSet::new();
        for step in &steps {
            if step.code.trim().is_empty() {
                return Err(Error::BadDefinition("step code is required".into()));
            }
            if step.handler.trim().is_empty() {
                return Err(Error::BadDefinition(format!(
                    "step {} has no handler",
                    step.code
                )));
            }
            if !seen.insert(step.code.clone()) {
                return Err(Error::BadDefinition(format!(
                    "duplicate step code: {}",
                    step.code
                )));
            }
        }
        for step in &steps {
            for dep in &step.depends_on {
                if dep == &step.code {
                    return Err(Error::BadDefinition(format!(
                        "step {} depends on itself",
                        step.code
                    )));
                }
                if !seen.contains(dep) {
                    return Err(Error::BadDefinition(format!(
                        "step {} depends on unknown step {}",
                        step.code, dep
                    )));
                }
            }
        }
        topological_check(&steps)?;

        for (key, step_code) in &spec.output_mapping {
            if !seen.contains(step_code) {
                return Err(Error::BadDefinition(format!(
                    "output_mapping {key} references unknown step {step_code}"
                )));
            }
        }

        // An unsafe step runs at most once; pinning the fields keeps the
        // stored row honest about what the engine will do.
        for step in &mut steps {
            if !step.safe_to_retry {
                step.max_attempts = Some(1);
                step.retry_on = None;
            }
        }

        let input_schema = spec
            .input_schema
            .as_ref()
            .map(Schema::parse)
            .transpose()
            .map_err(|e| Error::BadDefinition(format!("input_schema: {e}")))?;
        let output_schema = spec
            .output_schema
            .as_ref()
            .map(Schema::parse)
            .transpose()
            .map_err(|e| Error::BadDefinition(format!("output_schema: {e}")))?;

        Ok(Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            code: spec.code,
            version,
            status: DefinitionStatus::Draft,
            steps,
            policies: spec.policies,
            input_schema,
            output_schema,
            output_mapping: spec.output_mapping,
            created_at: now,
            published_at: None,
        })
    }

    pub fn step(&self, code: &str) -> Option<&StepDescriptor> {
        self.steps.iter().find(|s| s.code == code)
    }
}

/// Kahn's algorithm; only the cycle check matters, the orchestrator
/// schedules from readiness, not from a precomputed order.
fn topological_check(steps: &[StepDescriptor]) -> Result<(), Error> {
    let mut indegree: HashMap<&str, usize> = steps
        .iter()
        .map(|s| (s.code.as_str(), s.depends_on.len()))
        .collect();
    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(c, _)| *c)
        .collect();
    let mut visited = 0;

    while let Some(code) = ready.pop() {
        visited += 1;
        for step in steps {
            if step.depends_on.iter().any(|d| d == code) {
                let degree = indegree
                    .get_mut(step.code.as_str())
                    .ok_or_else(|| Error::Internal("indegree map out of sync".into()))?;
                *degree -= 1;
                if *degree == 0 {
                    ready.push(step.code.as_str());
                }
            }
        }
    }

    if visited != steps.len() {
        return Err(Error::BadDefinition("dependency cycle detected".into()));
    }
    Ok(())
}
