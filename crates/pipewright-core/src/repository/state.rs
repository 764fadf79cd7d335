//! Run-state store trait definition.
//!
//! Defines the persistence interface the workflow engine depends on for run
//! and step records. The infrastructure layer (pipewright-infra) implements
//! this trait with SQLite persistence.

use std::collections::HashMap;

use pipewright_types::error::RepositoryError;
use pipewright_types::workflow::{
    NewRun, NewStepRun, RunSnapshot, RunStatus, StepStatus, WorkflowRun,
};
use uuid::Uuid;

/// Repository trait for workflow run state.
///
/// Covers two entity families:
/// - **Runs:** one record per engine invocation, with a completed-step counter.
/// - **Step runs:** one record per (run, step) pair.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StateStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a run record in `pending` status and return its assigned ID.
    fn create_run(
        &self,
        run: &NewRun,
    ) -> impl std::future::Future<Output = Result<Uuid, RepositoryError>> + Send;

    /// Set a run's status without touching its error or completion time.
    ///
    /// A run already in a terminal status is left unchanged.
    fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Move a run to a terminal status, stamping `completed_at` and the error.
    ///
    /// Terminal statuses are final: if the run already holds one, this
    /// succeeds without changing anything.
    fn complete_run(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List the most recent runs, newest first.
    fn list_runs(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Get a run and all of its step records, or `None` for an unknown ID.
    fn get_run_status(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<RunSnapshot>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step runs
    // -----------------------------------------------------------------------

    /// Create a `pending` step record.
    ///
    /// Must succeed without changes when the (run, step) record already exists.
    fn create_step_run(
        &self,
        run_id: &Uuid,
        step: &NewStepRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace the recorded prompt with its rendered form.
    fn set_step_prompt(
        &self,
        run_id: &Uuid,
        step_id: &str,
        prompt: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Update a step's status and optionally its result/error.
    ///
    /// Entering a terminal status increments the run's completed-step counter
    /// in the same transaction; leaving one decrements it.
    fn update_step_status(
        &self,
        run_id: &Uuid,
        step_id: &str,
        status: StepStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Results of the run's completed steps keyed by step ID.
    fn get_step_results(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<HashMap<String, String>, RepositoryError>> + Send;
}
