//! Deterministic in-memory stand-ins for the engine's collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use pipewright_types::error::RepositoryError;
use pipewright_types::workflow::{
    NewRun, NewStepRun, RunSnapshot, RunStatus, StepRun, StepStatus, WorkflowRun,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ports::agent::{AgentError, AgentRunner};
use crate::ports::channel::{ChannelSender, DeliveryError};
use crate::repository::state::StateStore;

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    runs: Vec<WorkflowRun>,
    steps: Vec<StepRun>,
}

/// `StateStore` backed by vectors behind a mutex.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_create_run: AtomicBool,
    step_result_reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create_run` calls fail.
    pub fn fail_create_run(&self, fail: bool) {
        self.fail_create_run.store(fail, Ordering::SeqCst);
    }

    pub fn run(&self, run_id: &Uuid) -> Option<WorkflowRun> {
        self.lock().runs.iter().find(|r| r.id == *run_id).cloned()
    }

    pub fn steps(&self, run_id: &Uuid) -> Vec<StepRun> {
        self.lock()
            .steps
            .iter()
            .filter(|s| s.run_id == *run_id)
            .cloned()
            .collect()
    }

    pub fn step(&self, run_id: &Uuid, step_id: &str) -> Option<StepRun> {
        self.steps(run_id).into_iter().find(|s| s.step_id == step_id)
    }

    /// Number of `get_step_results` calls served.
    pub fn step_result_reads(&self) -> usize {
        self.step_result_reads.load(Ordering::SeqCst)
    }

    pub fn run_count(&self) -> usize {
        self.lock().runs.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }
}

impl StateStore for MemoryStore {
    async fn create_run(&self, run: &NewRun) -> Result<Uuid, RepositoryError> {
        if self.fail_create_run.load(Ordering::SeqCst) {
            return Err(RepositoryError::Connection);
        }
        let id = Uuid::now_v7();
        self.lock().runs.push(WorkflowRun {
            id,
            workflow_name: run.workflow_name.clone(),
            description: run.description.clone(),
            status: RunStatus::Pending,
            total_steps: run.total_steps,
            completed_steps: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        });
        Ok(id)
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == *run_id)
            .ok_or(RepositoryError::NotFound)?;
        if !run.status.is_terminal() {
            run.status = status;
        }
        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == *run_id)
            .ok_or(RepositoryError::NotFound)?;
        if run.status.is_terminal() {
            return Ok(());
        }
        run.status = status;
        run.error = error.map(str::to_string);
        run.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
        Ok(self
            .lock()
            .runs
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get_run_status(&self, run_id: &Uuid) -> Result<Option<RunSnapshot>, RepositoryError> {
        Ok(self.run(run_id).map(|run| RunSnapshot {
            steps: self.steps(run_id),
            run,
        }))
    }

    async fn create_step_run(
        &self,
        run_id: &Uuid,
        step: &NewStepRun,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        let exists = state
            .steps
            .iter()
            .any(|s| s.run_id == *run_id && s.step_id == step.step_id);
        if !exists {
            state.steps.push(StepRun {
                run_id: *run_id,
                step_id: step.step_id.clone(),
                agent: step.agent.clone(),
                prompt: step.prompt.clone(),
                status: StepStatus::Pending,
                result: None,
                error: None,
                started_at: None,
                completed_at: None,
            });
        }
        Ok(())
    }

    async fn set_step_prompt(
        &self,
        run_id: &Uuid,
        step_id: &str,
        prompt: &str,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        let step = state
            .steps
            .iter_mut()
            .find(|s| s.run_id == *run_id && s.step_id == step_id)
            .ok_or(RepositoryError::NotFound)?;
        step.prompt = prompt.to_string();
        Ok(())
    }

    async fn update_step_status(
        &self,
        run_id: &Uuid,
        step_id: &str,
        status: StepStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        let step = state
            .steps
            .iter_mut()
            .find(|s| s.run_id == *run_id && s.step_id == step_id)
            .ok_or(RepositoryError::NotFound)?;
        let was_terminal = step.status.is_terminal();
        step.status = status;
        let now = Utc::now();
        if status == StepStatus::Running {
            step.result = None;
            step.error = None;
            step.started_at = Some(now);
        } else {
            if result.is_some() {
                step.result = result.map(str::to_string);
            }
            if error.is_some() {
                step.error = error.map(str::to_string);
            }
        }
        step.completed_at = status.is_terminal().then_some(now);

        if let Some(run) = state.runs.iter_mut().find(|r| r.id == *run_id) {
            match (was_terminal, status.is_terminal()) {
                (false, true) => run.completed_steps += 1,
                (true, false) => run.completed_steps = run.completed_steps.saturating_sub(1),
                _ => {}
            }
        }
        Ok(())
    }

    async fn get_step_results(
        &self,
        run_id: &Uuid,
    ) -> Result<HashMap<String, String>, RepositoryError> {
        self.step_result_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .steps(run_id)
            .into_iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| s.result.map(|r| (s.step_id, r)))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ScriptedRunner
// ---------------------------------------------------------------------------

/// What the scripted runner does for a given step.
#[derive(Debug, Clone)]
pub enum Behavior {
    Reply(String),
    Fail(String),
    /// Sleep, then reply.
    Delay(Duration, String),
    /// Block until the call's cancellation token fires.
    WaitForCancel,
}

#[derive(Default)]
struct RunnerState {
    script: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// `AgentRunner` whose behavior is scripted per step ID.
///
/// Steps without a script reply with `"<step-id> done"`.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    state: Arc<RunnerState>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, step_id: &str, behavior: Behavior) -> Self {
        self.state
            .script
            .lock()
            .unwrap()
            .insert(step_id.to_string(), behavior);
        self
    }

    /// Every `(session_key, prompt)` received, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn prompt_for(&self, step_id: &str) -> Option<String> {
        self.calls()
            .into_iter()
            .find(|(key, _)| step_of(key) == step_id)
            .map(|(_, prompt)| prompt)
    }

    pub fn was_called(&self, step_id: &str) -> bool {
        self.prompt_for(step_id).is_some()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

fn step_of(session_key: &str) -> &str {
    session_key.rsplit(':').next().unwrap_or(session_key)
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AgentRunner for ScriptedRunner {
    async fn run(
        &self,
        session_key: &str,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<String, AgentError> {
        let step_id = step_of(session_key).to_string();
        self.state
            .calls
            .lock()
            .unwrap()
            .push((session_key.to_string(), prompt.to_string()));

        let current = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.state.in_flight);
        self.state.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let behavior = self.state.script.lock().unwrap().get(&step_id).cloned();
        match behavior {
            None => Ok(format!("{step_id} done")),
            Some(Behavior::Reply(text)) => Ok(text),
            Some(Behavior::Fail(reason)) => Err(AgentError::Execution(reason)),
            Some(Behavior::Delay(wait, text)) => {
                tokio::time::sleep(wait).await;
                Ok(text)
            }
            Some(Behavior::WaitForCancel) => {
                cancel.cancelled().await;
                Err(AgentError::Cancelled)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingSender
// ---------------------------------------------------------------------------

/// `ChannelSender` that records deliveries, fails for chosen targets, and can
/// hold a target's delivery until released.
#[derive(Clone, Default)]
pub struct RecordingSender {
    sent: Arc<Mutex<Vec<(String, String)>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    held: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(self, target: &str) -> Self {
        self.failing.lock().unwrap().insert(target.to_string());
        self
    }

    /// Block deliveries to `target` (after recording them) until `release`
    /// is notified.
    pub fn held_until(self, target: &str, release: Arc<Notify>) -> Self {
        self.held
            .lock()
            .unwrap()
            .insert(target.to_string(), release);
        self
    }

    /// Every `(target, text)` attempted, in order, including failed ones.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl ChannelSender for RecordingSender {
    async fn send_message(&self, target: &str, text: &str) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .unwrap()
            .push((target.to_string(), text.to_string()));
        let release = self.held.lock().unwrap().get(target).cloned();
        if let Some(release) = release {
            release.notified().await;
        }
        if self.failing.lock().unwrap().contains(target) {
            return Err(DeliveryError {
                target: target.to_string(),
                reason: "channel unavailable".to_string(),
            });
        }
        Ok(())
    }
}
