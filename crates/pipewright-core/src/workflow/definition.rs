//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML text and the `Workflow` type, validates structural
//! constraints (unique IDs, resolvable dependencies, known agents, acyclicity),
//! and provides discovery for workflow files on disk.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use pipewright_types::workflow::{AgentKind, Workflow};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or checking a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Malformed definition text.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// The dependency graph could not be built.
    #[error("build error: {0}")]
    Build(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `Workflow`.
///
/// Runs `validate_workflow` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_workflow_yaml(yaml: &str) -> Result<Workflow, WorkflowError> {
    let workflow: Workflow =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_workflow(&workflow)?;
    Ok(workflow)
}

/// Serialize a `Workflow` to a YAML string.
pub fn serialize_workflow_yaml(workflow: &Workflow) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(workflow).map_err(|e| WorkflowError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `Workflow`.
///
/// Checks, stopping at the first failure:
/// - Name is non-empty
/// - At least one step exists
/// - Every step ID is non-empty and unique
/// - All `depends_on` references point to existing step IDs
/// - Agent names belong to [`AgentKind`]
/// - Step timeouts are non-zero
/// - The dependency relation has no cycle
pub fn validate_workflow(workflow: &Workflow) -> Result<(), WorkflowError> {
    if workflow.name.is_empty() {
        return Err(WorkflowError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }

    if workflow.steps.is_empty() {
        return Err(WorkflowError::Validation(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for (idx, step) in workflow.steps.iter().enumerate() {
        if step.id.is_empty() {
            return Err(WorkflowError::Validation(format!(
                "step at position {idx} has an empty ID"
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    for step in &workflow.steps {
        for dep in &step.depends_on {
            if !seen_ids.contains(dep.as_str()) {
                return Err(WorkflowError::Validation(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }
    }

    for step in &workflow.steps {
        if step.agent.parse::<AgentKind>().is_err() {
            return Err(WorkflowError::Validation(format!(
                "step '{}' uses unknown agent '{}'",
                step.id, step.agent
            )));
        }
    }

    for step in &workflow.steps {
        if step.timeout.is_some_and(|t| t.is_zero()) {
            return Err(WorkflowError::Validation(format!(
                "step '{}' timeout must be > 0",
                step.id
            )));
        }
    }

    if let Some(step_id) = find_cycle(workflow) {
        return Err(WorkflowError::Validation(format!(
            "circular dependency involving step '{step_id}'"
        )));
    }

    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Three-color depth-first search over `depends_on` edges.
///
/// Returns the step reached through a back-edge, if any.
fn find_cycle(workflow: &Workflow) -> Option<String> {
    let deps: HashMap<&str, &[String]> = workflow
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.as_slice()))
        .collect();
    let mut marks: HashMap<&str, Mark> = deps.keys().map(|id| (*id, Mark::White)).collect();

    fn visit<'a>(
        id: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Option<String> {
        match marks.get(id).copied() {
            Some(Mark::Gray) => return Some(id.to_string()),
            Some(Mark::Black) | None => return None,
            Some(Mark::White) => {}
        }
        marks.insert(id, Mark::Gray);
        for dep in deps.get(id).copied().unwrap_or_default() {
            if let Some(found) = visit(dep.as_str(), deps, marks) {
                return Some(found);
            }
        }
        marks.insert(id, Mark::Black);
        None
    }

    for step in &workflow.steps {
        if let Some(found) = visit(step.id.as_str(), &deps, &mut marks) {
            return Some(found);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<Workflow, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, workflow: &Workflow) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(workflow)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively. Files that fail to parse
/// or validate are skipped with a warning.
pub fn discover_workflows(base_dir: &Path) -> Result<Vec<(PathBuf, Workflow)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, Workflow)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_workflow_file(&path) {
                Ok(workflow) => results.push((path, workflow)),
                Err(e) => {
                    tracing::warn!(?path, error = %e, "skipping unloadable workflow file");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
