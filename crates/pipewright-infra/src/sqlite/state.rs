//! SQLite run-state store implementation.
//!
//! Implements `StateStore` from `pipewright-core` using sqlx with split
//! read/write pools. Each run has one `workflow_runs` row and one `step_runs`
//! row per step; the run row carries a counter of terminal steps that is kept
//! in step with step transitions inside a single transaction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use pipewright_core::repository::state::StateStore;
use pipewright_types::error::RepositoryError;
use pipewright_types::workflow::{
    NewRun, NewStepRun, RunSnapshot, RunStatus, StepRun, StepStatus, WorkflowRun,
};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `StateStore`.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: DatabasePool,
}

impl SqliteStateStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Runs left `pending` or `running`, oldest first.
    ///
    /// After a restart these are runs whose process died mid-execution;
    /// callers can continue them with the engine's `resume_with`.
    pub async fn list_interrupted_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE status IN ('pending', 'running') ORDER BY started_at ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(run_from_row).collect()
    }

    /// Resolve a status write that matched no row.
    ///
    /// The run either does not exist (`NotFound`) or already holds a terminal
    /// status, in which case the write is dropped.
    async fn ensure_terminal_run(
        &self,
        run_id: &Uuid,
        requested: RunStatus,
    ) -> Result<(), RepositoryError> {
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM workflow_runs WHERE id = ?")
                .bind(run_id.to_string())
                .fetch_optional(&self.pool.writer)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match current {
            None => Err(RepositoryError::NotFound),
            Some(current) => {
                tracing::debug!(
                    run_id = %run_id,
                    current = current.as_str(),
                    requested = %requested,
                    "run already terminal, status write ignored"
                );
                Ok(())
            }
        }
    }

    /// Delete a run and (via cascade) its step records.
    pub async fn delete_run(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    workflow_name: String,
    description: String,
    status: String,
    total_steps: i64,
    completed_steps: i64,
    started_at: String,
    completed_at: Option<String>,
    error: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_name: row.try_get("workflow_name")?,
            description: row.try_get("description")?,
            status: row.try_get("status")?,
            total_steps: row.try_get("total_steps")?,
            completed_steps: row.try_get("completed_steps")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            workflow_name: self.workflow_name,
            description: self.description,
            status: self.status.parse::<RunStatus>().map_err(RepositoryError::Query)?,
            total_steps: parse_count(self.total_steps)?,
            completed_steps: parse_count(self.completed_steps)?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            error: self.error,
        })
    }
}

struct StepRow {
    run_id: String,
    step_id: String,
    agent: String,
    prompt: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_id: row.try_get("step_id")?,
            agent: row.try_get("agent")?,
            prompt: row.try_get("prompt")?,
            status: row.try_get("status")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_step_run(self) -> Result<StepRun, RepositoryError> {
        Ok(StepRun {
            run_id: parse_uuid(&self.run_id)?,
            step_id: self.step_id,
            agent: self.agent,
            prompt: self.prompt,
            status: self.status.parse::<StepStatus>().map_err(RepositoryError::Query)?,
            result: self.result,
            error: self.error,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn run_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowRun, RepositoryError> {
    RunRow::from_row(row)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .into_run()
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn parse_count(value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| RepositoryError::Query(format!("invalid step count: {value}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// StateStore impl
// ---------------------------------------------------------------------------

impl StateStore for SqliteStateStore {
    async fn create_run(&self, run: &NewRun) -> Result<Uuid, RepositoryError> {
        let id = Uuid::now_v7();

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, workflow_name, description, status, total_steps, completed_steps, started_at)
               VALUES (?, ?, ?, 'pending', ?, 0, ?)"#,
        )
        .bind(id.to_string())
        .bind(&run.workflow_name)
        .bind(&run.description)
        .bind(i64::from(run.total_steps))
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(run_id = %id, workflow = run.workflow_name.as_str(), "run record created");
        Ok(id)
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET status = ? WHERE id = ? AND status NOT IN (?, ?, ?)",
        )
        .bind(status.to_string())
        .bind(run_id.to_string())
        .bind(RunStatus::Completed.to_string())
        .bind(RunStatus::Failed.to_string())
        .bind(RunStatus::Cancelled.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return self.ensure_terminal_run(run_id, status).await;
        }
        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_runs SET status = ?, error = ?, completed_at = ?
               WHERE id = ? AND status NOT IN (?, ?, ?)"#,
        )
        .bind(status.to_string())
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.to_string())
        .bind(RunStatus::Completed.to_string())
        .bind(RunStatus::Failed.to_string())
        .bind(RunStatus::Cancelled.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return self.ensure_terminal_run(run_id, status).await;
        }
        Ok(())
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(run_from_row).collect()
    }

    async fn get_run_status(&self, run_id: &Uuid) -> Result<Option<RunSnapshot>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let run = run_from_row(&row)?;

        let rows = sqlx::query("SELECT * FROM step_runs WHERE run_id = ? ORDER BY rowid ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            steps.push(r.into_step_run()?);
        }

        Ok(Some(RunSnapshot { run, steps }))
    }

    async fn create_step_run(
        &self,
        run_id: &Uuid,
        step: &NewStepRun,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO step_runs (run_id, step_id, agent, prompt, status)
               VALUES (?, ?, ?, ?, 'pending')
               ON CONFLICT (run_id, step_id) DO NOTHING"#,
        )
        .bind(run_id.to_string())
        .bind(&step.step_id)
        .bind(&step.agent)
        .bind(&step.prompt)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn set_step_prompt(
        &self,
        run_id: &Uuid,
        step_id: &str,
        prompt: &str,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE step_runs SET prompt = ? WHERE run_id = ? AND step_id = ?")
            .bind(prompt)
            .bind(run_id.to_string())
            .bind(step_id)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
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
        // Use a transaction: UPDATE step_runs + adjust workflow_runs.completed_steps
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let prior = sqlx::query(
            "SELECT status, result, error FROM step_runs WHERE run_id = ? AND step_id = ?",
        )
        .bind(run_id.to_string())
        .bind(step_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .ok_or(RepositoryError::NotFound)?;

        let prior_status: StepStatus = prior
            .try_get::<String, _>("status")
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .parse()
            .map_err(RepositoryError::Query)?;
        let prior_result: Option<String> = prior
            .try_get("result")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let prior_error: Option<String> = prior
            .try_get("error")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        // Starting (again) clears the previous attempt's outcome.
        let (result, error) = if status == StepStatus::Running {
            (None, None)
        } else {
            (
                result.map(str::to_string).or(prior_result),
                error.map(str::to_string).or(prior_error),
            )
        };
        let now = format_datetime(&Utc::now());
        let started_at = (status == StepStatus::Running).then(|| now.clone());
        let completed_at = status.is_terminal().then_some(now);

        sqlx::query(
            r#"UPDATE step_runs
               SET status = ?, result = ?, error = ?,
                   started_at = COALESCE(?, started_at), completed_at = ?
               WHERE run_id = ? AND step_id = ?"#,
        )
        .bind(status.to_string())
        .bind(&result)
        .bind(&error)
        .bind(&started_at)
        .bind(&completed_at)
        .bind(run_id.to_string())
        .bind(step_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let delta: i64 = match (prior_status.is_terminal(), status.is_terminal()) {
            (false, true) => 1,
            (true, false) => -1,
            _ => 0,
        };
        if delta != 0 {
            sqlx::query(
                "UPDATE workflow_runs SET completed_steps = MAX(completed_steps + ?, 0) WHERE id = ?",
            )
            .bind(delta)
            .bind(run_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_step_results(
        &self,
        run_id: &Uuid,
    ) -> Result<HashMap<String, String>, RepositoryError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT step_id, result FROM step_runs WHERE run_id = ? AND status = 'completed' AND result IS NOT NULL",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(rows.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
