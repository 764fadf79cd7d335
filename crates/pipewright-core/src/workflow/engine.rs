//! Workflow engine: wave-based DAG execution with persisted, resumable progress.
//!
//! `WorkflowEngine` runs validated workflows against three injected
//! collaborators: a [`StateStore`] for run/step records, an agent runner that
//! produces step results, and an optional channel sender for deliveries.
//!
//! # Execution flow
//!
//! 1. Validate the workflow and build its DAG.
//! 2. Create the run record and register a `CancellationToken` for it.
//! 3. Spawn the run loop on its own task. The task inherits the caller's
//!    tracing span but not its lifetime: dropping the caller's future does not
//!    stop the run. Only `cancel` or `shutdown` can.
//! 4. Each wave executes every ready step concurrently under a semaphore and
//!    waits for all of them before recomputing readiness.
//! 5. A failed wave or a cancelled token ends the loop. The loop then
//!    deregisters the token before choosing the final status, so a concurrent
//!    `cancel` either wins (run ends `cancelled`) or gets `RunNotFound`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pipewright_types::config::EngineConfig;
use pipewright_types::error::RepositoryError;
use pipewright_types::workflow::{
    NewRun, NewStepRun, ResumeReport, RunResult, RunSnapshot, RunStatus, Step, StepStatus,
    Workflow, WorkflowRun,
};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::ports::agent::BoxAgentRunner;
use crate::ports::channel::BoxChannelSender;
use crate::repository::state::StateStore;

use super::dag::Dag;
use super::definition::{WorkflowError, validate_workflow};
use super::template::{RenderError, render_prompt};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Error recorded on runs stopped through [`WorkflowEngine::cancel`].
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Error recorded on runs stopped through [`WorkflowEngine::shutdown`].
pub const CANCELLED_BY_SHUTDOWN: &str = "cancelled by engine shutdown";

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors that can occur while starting, executing or querying runs.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Definition or DAG error; raised before any run record exists.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// The agent runner returned an error for a step.
    #[error("step '{step_id}' failed: {error}")]
    StepFailed { step_id: String, error: String },

    /// A step exceeded its deadline.
    #[error("step '{step_id}' timed out after {timeout:?}")]
    StepTimeout { step_id: String, timeout: Duration },

    /// A step's prompt referenced results that were not available.
    #[error("step '{step_id}' failed: {source}")]
    Render { step_id: String, source: RenderError },

    /// Steps remain but none can start.
    #[error("no ready steps but {completed}/{total} completed")]
    NoReadySteps { completed: usize, total: usize },

    /// Run-state store error.
    #[error("persistence error: {0}")]
    Persistence(#[from] RepositoryError),

    /// Unknown run, or a run that is no longer active (for cancel).
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    /// The run exists but cannot be continued by `resume_with`.
    #[error("workflow run {run_id} cannot be resumed: {reason}")]
    RunNotResumable { run_id: Uuid, reason: String },

    /// The detached run task panicked or was aborted.
    #[error("task join error: {0}")]
    TaskJoin(String),
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

/// Agent session key for a step slot. Stable across retries and resumes.
pub fn session_key(workflow_name: &str, step_id: &str) -> String {
    format!("workflow:{workflow_name}:{step_id}")
}

/// Message delivered to a step's own targets when it completes.
pub fn format_step_message(workflow_name: &str, step_id: &str, result: &str) -> String {
    format!("[{workflow_name}/{step_id}]\n{result}")
}

/// Summary delivered to the workflow's targets after a successful run.
///
/// Lists each step's result in declaration order.
pub fn format_summary(workflow: &Workflow, results: &HashMap<String, String>) -> String {
    let mut out = format!("Workflow '{}' completed", workflow.name);
    for step in &workflow.steps {
        if let Some(result) = results.get(&step.id) {
            out.push_str(&format!("\n\n[{}]\n{}", step.id, result));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Executes workflows and tracks their cancellation handles.
///
/// Generic over `S: StateStore` for storage flexibility. Cloning is cheap and
/// every clone shares the same run registry.
pub struct WorkflowEngine<S: StateStore + 'static> {
    inner: Arc<EngineInner<S>>,
}

impl<S: StateStore + 'static> Clone for WorkflowEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct EngineInner<S> {
    store: S,
    runner: BoxAgentRunner,
    sender: Option<BoxChannelSender>,
    config: EngineConfig,
    /// Cancellation tokens keyed by run_id. Present only while a run is active.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

/// Everything a detached run loop owns.
struct RunPlan {
    run_id: Uuid,
    workflow: Arc<Workflow>,
    dag: Dag,
    started_at: DateTime<Utc>,
    /// Results of steps completed before this loop started (resume).
    seed: HashMap<String, String>,
    token: CancellationToken,
}

impl<S: StateStore + 'static> WorkflowEngine<S> {
    pub fn new(
        store: S,
        runner: BoxAgentRunner,
        sender: Option<BoxChannelSender>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                runner,
                sender,
                config,
                cancellation_tokens: DashMap::new(),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Execute a workflow and wait for its terminal result.
    ///
    /// Step failures and cancellation are reported through the returned
    /// `RunResult`; `Err` means the run could not be started at all.
    pub async fn run(&self, workflow: &Workflow) -> Result<RunResult, EngineError> {
        let plan = self.prepare(workflow).await?;
        self.spawn(plan)
            .await
            .map_err(|e| EngineError::TaskJoin(e.to_string()))
    }

    /// Start a workflow in the background and return its run ID.
    ///
    /// Every step record exists (as `pending`) before this returns, so an
    /// immediate `status` call sees the full step list.
    pub async fn run_async(&self, workflow: &Workflow) -> Result<Uuid, EngineError> {
        let plan = self.prepare(workflow).await?;
        let run_id = plan.run_id;

        for step in &workflow.steps {
            if let Err(e) = self
                .inner
                .store
                .create_step_run(&run_id, &new_step_run(step))
                .await
            {
                tracing::warn!(
                    run_id = %run_id,
                    step_id = step.id.as_str(),
                    error = %e,
                    "failed to pre-create step record"
                );
            }
        }

        drop(self.spawn(plan));
        Ok(run_id)
    }

    /// Report what is persisted for a run.
    ///
    /// Step structure is not persisted, so this cannot continue the run by
    /// itself; pass the original definition to [`resume_with`](Self::resume_with).
    pub async fn resume(&self, run_id: &Uuid) -> Result<ResumeReport, EngineError> {
        let snapshot = self.status(run_id).await?;
        let pending_steps = snapshot
            .steps
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.step_id.clone())
            .collect();
        let resumable = !snapshot.run.status.is_terminal()
            && !self.inner.cancellation_tokens.contains_key(run_id);
        let step_results = self.inner.store.get_step_results(run_id).await?;

        Ok(ResumeReport {
            run_id: *run_id,
            workflow_name: snapshot.run.workflow_name.clone(),
            status: snapshot.run.status,
            step_results,
            pending_steps,
            resumable,
        })
    }

    /// Continue an interrupted run using its original definition.
    ///
    /// Completed steps keep their persisted results; every other step runs
    /// again under the same run ID. The run must be non-terminal, belong to
    /// `workflow`, and not be active in this engine.
    pub async fn resume_with(
        &self,
        run_id: &Uuid,
        workflow: &Workflow,
    ) -> Result<RunResult, EngineError> {
        validate_workflow(workflow)?;
        let dag = Dag::build(&workflow.steps)?;

        let snapshot = self
            .inner
            .store
            .get_run_status(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(*run_id))?;

        if snapshot.run.workflow_name != workflow.name {
            return Err(EngineError::RunNotResumable {
                run_id: *run_id,
                reason: format!(
                    "run belongs to workflow '{}'",
                    snapshot.run.workflow_name
                ),
            });
        }
        if snapshot.run.status.is_terminal() {
            return Err(EngineError::RunNotResumable {
                run_id: *run_id,
                reason: format!("run is already {}", snapshot.run.status),
            });
        }

        let seed: HashMap<String, String> = self
            .inner
            .store
            .get_step_results(run_id)
            .await?
            .into_iter()
            .filter(|(id, _)| workflow.step(id).is_some())
            .collect();

        let token = CancellationToken::new();
        match self.inner.cancellation_tokens.entry(*run_id) {
            Entry::Occupied(_) => {
                return Err(EngineError::RunNotResumable {
                    run_id: *run_id,
                    reason: "run is still active".to_string(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }


        tracing::info!(
            run_id = %run_id,
            workflow = workflow.name.as_str(),
            completed = seed.len(),
            "resuming workflow run"
        );

        let plan = RunPlan {
            run_id: *run_id,
            workflow: Arc::new(workflow.clone()),
            dag,
            started_at: snapshot.run.started_at,
            seed,
            token,
        };
        self.spawn(plan)
            .await
            .map_err(|e| EngineError::TaskJoin(e.to_string()))
    }

    /// Cancel an active run.
    ///
    /// The loop observes cancellation at the next wave boundary; in-flight
    /// agent calls receive a child token they may honor.
    pub async fn cancel(&self, run_id: &Uuid) -> Result<(), EngineError> {
        let Some((_, token)) = self.inner.cancellation_tokens.remove(run_id) else {
            return Err(EngineError::RunNotFound(*run_id));
        };
        token.cancel();

        self.inner
            .store
            .complete_run(run_id, RunStatus::Cancelled, Some(CANCELLED_BY_USER))
            .await?;

        tracing::info!(run_id = %run_id, "workflow cancelled");
        Ok(())
    }

    /// Cancel every active run.
    pub fn shutdown(&self) {
        let mut cancelled = 0usize;
        for entry in self.inner.cancellation_tokens.iter() {
            entry.value().cancel();
            cancelled += 1;
        }
        tracing::info!(runs = cancelled, "workflow engine shutting down");
    }

    /// Persisted run record and step records.
    pub async fn status(&self, run_id: &Uuid) -> Result<RunSnapshot, EngineError> {
        self.inner
            .store
            .get_run_status(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(*run_id))
    }

    /// Most recent runs, newest first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<WorkflowRun>, EngineError> {
        Ok(self.inner.store.list_runs(limit).await?)
    }

    /// IDs of runs currently executing in this engine.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.inner
            .cancellation_tokens
            .iter()
            .map(|entry| *entry.key())
            .collect()
    }

    /// Validate, create the run record, and register its token.
    ///
    /// Fails without persisting anything when the workflow is invalid.
    async fn prepare(&self, workflow: &Workflow) -> Result<RunPlan, EngineError> {
        validate_workflow(workflow)?;
        let dag = Dag::build(&workflow.steps)?;

        let new_run = NewRun {
            workflow_name: workflow.name.clone(),
            description: workflow.description.clone(),
            total_steps: u32::try_from(workflow.steps.len()).unwrap_or(u32::MAX),
        };
        let started_at = Utc::now();
        let run_id = self.inner.store.create_run(&new_run).await?;

        let token = CancellationToken::new();
        self.inner
            .cancellation_tokens
            .insert(run_id, token.clone());

        Ok(RunPlan {
            run_id,
            workflow: Arc::new(workflow.clone()),
            dag,
            started_at,
            seed: HashMap::new(),
            token,
        })
    }

    fn spawn(&self, plan: RunPlan) -> JoinHandle<RunResult> {
        let span = tracing::info_span!(
            "workflow_run",
            run_id = %plan.run_id,
            workflow = plan.workflow.name.as_str()
        );
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.execute(plan).await }.instrument(span))
    }
}

fn new_step_run(step: &Step) -> NewStepRun {
    NewStepRun {
        step_id: step.id.clone(),
        agent: step.agent.clone(),
        prompt: step.prompt.clone(),
    }
}

impl<S: StateStore + 'static> EngineInner<S> {
    /// The run loop. Never fails: every outcome becomes a terminal status.
    async fn execute(self: Arc<Self>, plan: RunPlan) -> RunResult {
        let RunPlan {
            run_id,
            workflow,
            dag,
            started_at,
            seed,
            token,
        } = plan;
        let total = workflow.steps.len();

        tracing::info!(
            run_id = %run_id,
            workflow = workflow.name.as_str(),
            steps = total,
            "workflow run started"
        );

        if let Err(e) = self
            .store
            .update_run_status(&run_id, RunStatus::Running)
            .await
        {
            tracing::warn!(run_id = %run_id, error = %e, "failed to mark run running");
        }

        let mut completed: HashSet<String> = seed.keys().cloned().collect();
        let mut results = seed;
        let mut failures: Vec<String> = Vec::new();
        let mut wave = 0usize;

        while completed.len() < total {
            if token.is_cancelled() {
                break;
            }

            let ready: Vec<Step> = dag
                .ready(&completed)
                .into_iter()
                .filter_map(|id| workflow.step(id))
                .cloned()
                .collect();
            if ready.is_empty() {
                failures.push(
                    EngineError::NoReadySteps {
                        completed: completed.len(),
                        total,
                    }
                    .to_string(),
                );
                break;
            }

            tracing::debug!(
                run_id = %run_id,
                wave,
                steps = ready.len(),
                "processing wave"
            );

            // Steps see only results that existed when the wave started.
            let available = Arc::new(results.clone());
            let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
            let mut join_set = JoinSet::new();

            for step in ready {
                let engine = Arc::clone(&self);
                let workflow = Arc::clone(&workflow);
                let available = Arc::clone(&available);
                let semaphore = Arc::clone(&semaphore);
                let token = token.clone();
                let span = tracing::info_span!(
                    "workflow_step",
                    run_id = %run_id,
                    step_id = step.id.as_str()
                );

                join_set.spawn(
                    async move {
                        let _permit = semaphore.acquire_owned().await.ok();
                        let outcome = engine
                            .execute_step(run_id, &workflow.name, &step, &available, &token)
                            .await;
                        (step.id, outcome)
                    }
                    .instrument(span),
                );
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((step_id, Ok(output))) => {
                        completed.insert(step_id.clone());
                        results.insert(step_id, output);
                    }
                    Ok((step_id, Err(e))) => {
                        tracing::warn!(
                            run_id = %run_id,
                            step_id = step_id.as_str(),
                            error = %e,
                            "step failed"
                        );
                        completed.insert(step_id);
                        failures.push(e.to_string());
                    }
                    Err(e) => failures.push(EngineError::TaskJoin(e.to_string()).to_string()),
                }
            }

            wave += 1;
            if !failures.is_empty() {
                break;
            }
        }

        // Whichever of this loop and `cancel` removes the registry entry owns
        // the final status. After this point `cancel` reports `RunNotFound`.
        let claimed = self.cancellation_tokens.remove(&run_id).is_some();
        let (status, error) = if !claimed {
            (RunStatus::Cancelled, Some(CANCELLED_BY_USER.to_string()))
        } else if token.is_cancelled() {
            // `shutdown` cancels without deregistering.
            (RunStatus::Cancelled, Some(CANCELLED_BY_SHUTDOWN.to_string()))
        } else if failures.is_empty() {
            (RunStatus::Completed, None)
        } else {
            (RunStatus::Failed, Some(failures.join("; ")))
        };

        if status == RunStatus::Completed && !workflow.deliver_to.is_empty() {
            let summary = format_summary(&workflow, &results);
            for target in &workflow.deliver_to {
                self.deliver(target, &summary).await;
            }
        }

        if let Err(e) = self
            .store
            .complete_run(&run_id, status, error.as_deref())
            .await
        {
            tracing::warn!(run_id = %run_id, error = %e, "failed to persist final run status");
        }

        tracing::info!(
            run_id = %run_id,
            workflow = workflow.name.as_str(),
            status = %status,
            completed = completed.len(),
            total,
            "workflow run finished"
        );

        RunResult {
            run_id,
            workflow_name: workflow.name.clone(),
            status,
            step_results: results,
            error,
            started_at,
            completed_at: Utc::now(),
        }
    }

    async fn execute_step(
        &self,
        run_id: Uuid,
        workflow_name: &str,
        step: &Step,
        available: &HashMap<String, String>,
        token: &CancellationToken,
    ) -> Result<String, EngineError> {
        if let Err(e) = self
            .store
            .create_step_run(&run_id, &new_step_run(step))
            .await
        {
            tracing::warn!(
                run_id = %run_id,
                step_id = step.id.as_str(),
                error = %e,
                "failed to create step record"
            );
        }

        let prompt = match render_prompt(&step.prompt, available) {
            Ok(prompt) => prompt,
            Err(source) => {
                self.mark_step(run_id, &step.id, StepStatus::Failed, None, Some(&source.to_string()))
                    .await;
                return Err(EngineError::Render {
                    step_id: step.id.clone(),
                    source,
                });
            }
        };

        if prompt != step.prompt {
            if let Err(e) = self.store.set_step_prompt(&run_id, &step.id, &prompt).await {
                tracing::warn!(
                    run_id = %run_id,
                    step_id = step.id.as_str(),
                    error = %e,
                    "failed to store rendered prompt"
                );
            }
        }
        self.mark_step(run_id, &step.id, StepStatus::Running, None, None)
            .await;

        let deadline = step
            .timeout
            .unwrap_or_else(|| self.config.default_step_timeout());
        let key = session_key(workflow_name, &step.id);
        let call = self.runner.run(&key, &prompt, token.child_token());

        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(output)) => {
                self.mark_step(run_id, &step.id, StepStatus::Completed, Some(&output), None)
                    .await;
                if !step.deliver_to.is_empty() {
                    let message = format_step_message(workflow_name, &step.id, &output);
                    for target in &step.deliver_to {
                        self.deliver(target, &message).await;
                    }
                }
                tracing::debug!(run_id = %run_id, step_id = step.id.as_str(), "step completed");
                Ok(output)
            }
            Ok(Err(e)) => {
                let error = e.to_string();
                self.mark_step(run_id, &step.id, StepStatus::Failed, None, Some(&error))
                    .await;
                Err(EngineError::StepFailed {
                    step_id: step.id.clone(),
                    error,
                })
            }
            Err(_elapsed) => {
                let error = format!("timed out after {deadline:?}");
                self.mark_step(run_id, &step.id, StepStatus::Failed, None, Some(&error))
                    .await;
                Err(EngineError::StepTimeout {
                    step_id: step.id.clone(),
                    timeout: deadline,
                })
            }
        }
    }

    async fn mark_step(
        &self,
        run_id: Uuid,
        step_id: &str,
        status: StepStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) {
        if let Err(e) = self
            .store
            .update_step_status(&run_id, step_id, status, result, error)
            .await
        {
            tracing::warn!(
                run_id = %run_id,
                step_id,
                status = %status,
                error = %e,
                "failed to persist step status"
            );
        }
    }

    async fn deliver(&self, target: &str, text: &str) {
        let Some(sender) = &self.sender else {
            tracing::debug!(channel = target, "no channel sender configured, skipping delivery");
            return;
        };
        if let Err(e) = sender.send_message(target, text).await {
            tracing::warn!(channel = target, error = %e, "delivery failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
