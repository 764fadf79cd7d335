//! Workflow domain types for Pipewright.
//!
//! Defines the definition-side types (`Workflow`, `Step`, `AgentKind`) that
//! YAML files and programmatic callers build, and the execution-side records
//! (`WorkflowRun`, `StepRun`, `RunResult`, `RunSnapshot`) that the engine
//! persists and reports.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// A named pipeline of agent steps.
///
/// Immutable once validated: the engine only ever reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Pipeline name. Must be non-empty.
    pub name: String,
    /// Optional longer description, snapshotted onto each run.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Schedule expression. Opaque to the engine; consumed by external triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Channel targets that receive the final summary on success.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deliver_to: Vec<String>,
    /// Ordered step list forming the dependency graph.
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Create a workflow with the given name and steps and no delivery targets.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            schedule: None,
            deliver_to: Vec::new(),
            steps,
        }
    }

    /// Look up a step by ID.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// A single unit of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the workflow.
    pub id: String,
    /// Agent designation. Empty means the default agent; otherwise one of
    /// the names accepted by [`AgentKind::from_str`].
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent: String,
    /// Prompt template, may contain `{{<step-id>.result}}` placeholders.
    #[serde(default)]
    pub prompt: String,
    /// IDs of steps that must be terminal before this one starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Channel targets that receive this step's result as soon as it completes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deliver_to: Vec<String>,
    /// Per-step deadline. Falls back to the engine default when absent.
    #[serde(
        default,
        with = "timeout_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl Step {
    /// Create a default-agent step with no dependencies.
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: String::new(),
            prompt: prompt.into(),
            depends_on: Vec::new(),
            deliver_to: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_agent(mut self, agent: AgentKind) -> Self {
        self.agent = agent.as_str().to_string();
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn deliver_to<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deliver_to = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The closed set of agent designations a step may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AgentKind {
    /// No explicit agent; the runner picks its default.
    #[default]
    Default,
    Executor,
    Researcher,
    Planner,
    MemoryManager,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Default => "",
            AgentKind::Executor => "executor",
            AgentKind::Researcher => "researcher",
            AgentKind::Planner => "planner",
            AgentKind::MemoryManager => "memory-manager",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::Default => write!(f, "default"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(AgentKind::Default),
            "executor" => Ok(AgentKind::Executor),
            "researcher" => Ok(AgentKind::Researcher),
            "planner" => Ok(AgentKind::Planner),
            "memory-manager" => Ok(AgentKind::MemoryManager),
            other => Err(format!("unknown agent: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Timeout (de)serialization
// ---------------------------------------------------------------------------

/// Parse a duration such as `"90s"`, `"5m"`, `"1h30m"`, `"250ms"` or a bare
/// number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let text = input.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration '{input}': expected a number"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("invalid duration '{input}': {e}"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let overflow = || format!("invalid duration '{input}': overflow");
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60).ok_or_else(overflow)?),
            "h" => Duration::from_secs(value.checked_mul(3600).ok_or_else(overflow)?),
            unit => return Err(format!("invalid duration '{input}': unknown unit '{unit}'")),
        };
        total = total.checked_add(part).ok_or_else(overflow)?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Render a duration in the shortest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 {
        return format!("{}ms", d.as_millis());
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

mod timeout_serde {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimeout {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_str(&super::format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<RawTimeout>::deserialize(d)? {
            None => Ok(None),
            Some(RawTimeout::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
            Some(RawTimeout::Text(text)) => super::parse_duration(&text)
                .map(Some)
                .map_err(D::Error::custom),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
///
/// `pending -> running -> {completed, failed, cancelled}`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

/// Status of a single step within a run.
///
/// `pending -> running -> {completed, failed, skipped}`. The engine never
/// produces `skipped` itself; it is available to external collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// Input for creating a run record. The store assigns the run ID.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub workflow_name: String,
    pub description: String,
    pub total_steps: u32,
}

/// A single execution instance of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 run ID assigned at creation.
    pub id: Uuid,
    pub workflow_name: String,
    /// Description snapshot taken when the run was created.
    #[serde(default)]
    pub description: String,
    pub status: RunStatus,
    pub total_steps: u32,
    /// Number of steps currently in a terminal status.
    pub completed_steps: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Input for creating a step record.
#[derive(Debug, Clone)]
pub struct NewStepRun {
    pub step_id: String,
    pub agent: String,
    pub prompt: String,
}

/// Execution record for one (run, step) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub run_id: Uuid,
    pub step_id: String,
    #[serde(default)]
    pub agent: String,
    /// Prompt as last recorded: the raw template at creation, the rendered
    /// text once the step starts.
    #[serde(default)]
    pub prompt: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Engine reports
// ---------------------------------------------------------------------------

/// Outcome of a synchronous run. Not persisted as such.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    /// Results of steps that produced one. Failed and unstarted steps are absent.
    pub step_results: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Read projection of a run and its step records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: WorkflowRun,
    pub steps: Vec<StepRun>,
}

impl RunSnapshot {
    /// Look up a step record by step ID.
    pub fn step(&self, step_id: &str) -> Option<&StepRun> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Results of completed steps keyed by step ID.
    pub fn step_results(&self) -> HashMap<String, String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| s.result.clone().map(|r| (s.step_id.clone(), r)))
            .collect()
    }
}

/// What `resume` could recover for a run from persisted state alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeReport {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    pub step_results: HashMap<String, String>,
    /// Steps that have not completed, in creation order.
    pub pending_steps: Vec<String>,
    /// True when the run is non-terminal and can continue once the caller
    /// resupplies the workflow definition.
    pub resumable: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
