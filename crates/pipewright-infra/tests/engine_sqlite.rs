//! End-to-end runs of the workflow engine against the SQLite state store.

use std::sync::{Arc, Mutex};

use pipewright_core::ports::agent::{AgentError, AgentRunner, BoxAgentRunner};
use pipewright_core::repository::state::StateStore;
use pipewright_core::workflow::engine::WorkflowEngine;
use pipewright_infra::sqlite::pool::DatabasePool;
use pipewright_infra::sqlite::state::SqliteStateStore;
use pipewright_types::config::EngineConfig;
use pipewright_types::workflow::{NewRun, NewStepRun, RunStatus, Step, StepStatus, Workflow};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Replies with the prompt it was given, recording each call.
#[derive(Clone, Default)]
struct EchoRunner {
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl EchoRunner {
    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl AgentRunner for EchoRunner {
    async fn run(
        &self,
        session_key: &str,
        prompt: &str,
        _cancel: CancellationToken,
    ) -> Result<String, AgentError> {
        self.calls
            .lock()
            .unwrap()
            .push((session_key.to_string(), prompt.to_string()));
        if prompt.contains("explode") {
            return Err(AgentError::Execution("agent crashed".to_string()));
        }
        Ok(format!("echo: {prompt}"))
    }
}

fn digest() -> Workflow {
    Workflow::new(
        "digest",
        vec![
            Step::new("fetch", "fetch the news"),
            Step::new("summarize", "summarize {{fetch.result}}").depends_on(["fetch"]),
        ],
    )
}

async fn open_store(dir: &TempDir) -> SqliteStateStore {
    let pool = DatabasePool::open(&dir.path().join("state").join("runs.db"))
        .await
        .unwrap();
    SqliteStateStore::new(pool)
}

fn engine(store: SqliteStateStore, runner: &EchoRunner) -> WorkflowEngine<SqliteStateStore> {
    WorkflowEngine::new(
        store,
        BoxAgentRunner::new(runner.clone()),
        None,
        EngineConfig::default(),
    )
}

#[tokio::test]
async fn run_persists_results_and_progress() {
    let dir = TempDir::new().unwrap();
    let runner = EchoRunner::default();
    let engine = engine(open_store(&dir).await, &runner);

    let result = engine.run(&digest()).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.step_results["fetch"], "echo: fetch the news");
    assert_eq!(
        result.step_results["summarize"],
        "echo: summarize echo: fetch the news"
    );

    let snapshot = engine.status(&result.run_id).await.unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Completed);
    assert_eq!(snapshot.run.total_steps, 2);
    assert_eq!(snapshot.run.completed_steps, 2);
    assert!(snapshot.run.completed_at.is_some());
    assert!(snapshot.run.error.is_none());

    let ids: Vec<&str> = snapshot.steps.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(ids, ["fetch", "summarize"]);
    let summarize = snapshot.step("summarize").unwrap();
    assert_eq!(summarize.prompt, "summarize echo: fetch the news");
    assert_eq!(summarize.status, StepStatus::Completed);

    let calls = runner.calls();
    assert_eq!(calls[0].0, "workflow:digest:fetch");
    assert_eq!(calls[1].0, "workflow:digest:summarize");

    let runs = engine.list_runs(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, result.run_id);
}

#[tokio::test]
async fn failed_step_is_persisted() {
    let dir = TempDir::new().unwrap();
    let runner = EchoRunner::default();
    let engine = engine(open_store(&dir).await, &runner);

    let workflow = Workflow::new(
        "fragile",
        vec![
            Step::new("a", "explode now"),
            Step::new("b", "after {{a.result}}").depends_on(["a"]),
        ],
    );
    let result = engine.run(&workflow).await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("agent crashed"));

    let snapshot = engine.status(&result.run_id).await.unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Failed);
    assert_eq!(snapshot.run.completed_steps, 1);
    let a = snapshot.step("a").unwrap();
    assert_eq!(a.status, StepStatus::Failed);
    assert_eq!(a.error.as_deref(), Some("agent crashed"));
    assert!(snapshot.step("b").is_none());
    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test]
async fn interrupted_run_resumes_after_restart() {
    let dir = TempDir::new().unwrap();
    let workflow = digest();

    // A previous process finished `fetch` and died during `summarize`.
    let run_id = {
        let store = open_store(&dir).await;
        let run_id = store
            .create_run(&NewRun {
                workflow_name: workflow.name.clone(),
                description: workflow.description.clone(),
                total_steps: 2,
            })
            .await
            .unwrap();
        store
            .update_run_status(&run_id, RunStatus::Running)
            .await
            .unwrap();
        for (id, prompt) in [("fetch", "fetch the news"), ("summarize", "summarize cached")] {
            store
                .create_step_run(
                    &run_id,
                    &NewStepRun {
                        step_id: id.to_string(),
                        agent: String::new(),
                        prompt: prompt.to_string(),
                    },
                )
                .await
                .unwrap();
        }
        store
            .update_step_status(&run_id, "fetch", StepStatus::Running, None, None)
            .await
            .unwrap();
        store
            .update_step_status(&run_id, "fetch", StepStatus::Completed, Some("cached"), None)
            .await
            .unwrap();
        store
            .update_step_status(&run_id, "summarize", StepStatus::Running, None, None)
            .await
            .unwrap();
        run_id
    };

    let runner = EchoRunner::default();
    let engine = engine(open_store(&dir).await, &runner);

    let interrupted = engine.store().list_interrupted_runs().await.unwrap();
    assert_eq!(interrupted.len(), 1);
    assert_eq!(interrupted[0].id, run_id);

    let report = engine.resume(&run_id).await.unwrap();
    assert!(report.resumable);
    assert_eq!(report.pending_steps, ["summarize"]);
    assert_eq!(report.step_results["fetch"], "cached");

    let result = engine.resume_with(&run_id, &workflow).await.unwrap();
    assert_eq!(result.run_id, run_id);
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.step_results["fetch"], "cached");
    assert_eq!(result.step_results["summarize"], "echo: summarize cached");

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, "summarize cached");

    let snapshot = engine.status(&run_id).await.unwrap();
    assert_eq!(snapshot.run.completed_steps, 2);
    assert!(engine.store().list_interrupted_runs().await.unwrap().is_empty());
}
