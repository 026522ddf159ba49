//! Workflow engine boundary.
//!
//! The driver only talks to the engine through [`WorkflowEngine`] and [`RunHandle`],
//! so the HTTP adapter and the in-memory fake used by tests are interchangeable.

#[cfg(test)]
pub(crate) mod fake;
pub(crate) mod temporal;

use crate::model::{
    ClarificationAnswer, ClarificationBatch, EngineConfig, FinalResult, StatusSnapshot,
    UserQueryInput,
};
use async_trait::async_trait;
use rand::RngCore;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow run not found: {run_id}")]
    NotFound { run_id: String },
    #[error("workflow run already started: {run_id}")]
    AlreadyStarted { run_id: String },
    #[error("workflow engine unreachable at {url}: {message}")]
    Unreachable { url: String, message: String },
    #[error("workflow engine rejected request (status {status}) at {url}: {message}")]
    Rejected {
        status: u16,
        url: String,
        message: String,
    },
    #[error("update {name} was rejected: {message}")]
    UpdateRejected { name: &'static str, message: String },
    #[error("workflow run {run_id} finished as {status}: {message}")]
    RunFailed {
        run_id: String,
        status: ExecutionStatus,
        message: String,
    },
    #[error("unexpected engine response: {0}")]
    Decode(String),
}

impl EngineError {
    /// Connection failures, gateway/unavailable statuses (5xx) and throttling (429)
    /// say nothing about the run and may be retried. Everything else is an answer
    /// from the engine.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Unreachable { .. } => true,
            EngineError::Rejected { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}

/// Coarse execution status as tracked by the engine, independent of the
/// research run's own status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Running,
    ContinuedAsNew,
    Completed,
    Failed,
    Canceled,
    Terminated,
    TimedOut,
    Unspecified,
}

impl ExecutionStatus {
    /// Parses the engine's enum spelling, e.g. `WORKFLOW_EXECUTION_STATUS_RUNNING`.
    pub fn parse(raw: &str) -> Self {
        let name = raw
            .strip_prefix("WORKFLOW_EXECUTION_STATUS_")
            .unwrap_or(raw)
            .to_ascii_uppercase();
        match name.as_str() {
            "RUNNING" => ExecutionStatus::Running,
            "CONTINUED_AS_NEW" => ExecutionStatus::ContinuedAsNew,
            "COMPLETED" => ExecutionStatus::Completed,
            "FAILED" => ExecutionStatus::Failed,
            "CANCELED" => ExecutionStatus::Canceled,
            "TERMINATED" => ExecutionStatus::Terminated,
            "TIMED_OUT" => ExecutionStatus::TimedOut,
            _ => ExecutionStatus::Unspecified,
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, ExecutionStatus::Running | ExecutionStatus::ContinuedAsNew)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::ContinuedAsNew => "CONTINUED_AS_NEW",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Canceled => "CANCELED",
            ExecutionStatus::Terminated => "TERMINATED",
            ExecutionStatus::TimedOut => "TIMED_OUT",
            ExecutionStatus::Unspecified => "UNSPECIFIED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic read-modify-respond calls understood by the research run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunUpdate {
    StartResearch(UserQueryInput),
    SingleClarification(ClarificationAnswer),
    Clarifications(ClarificationBatch),
}

impl RunUpdate {
    /// Handler name registered by the workflow.
    pub fn name(&self) -> &'static str {
        match self {
            RunUpdate::StartResearch(_) => "start_research",
            RunUpdate::SingleClarification(_) => "provide_single_clarification",
            RunUpdate::Clarifications(_) => "provide_clarifications",
        }
    }

    pub fn payload(&self) -> Result<serde_json::Value, EngineError> {
        let v = match self {
            RunUpdate::StartResearch(input) => serde_json::to_value(input),
            RunUpdate::SingleClarification(input) => serde_json::to_value(input),
            RunUpdate::Clarifications(input) => serde_json::to_value(input),
        };
        v.map_err(|e| EngineError::Decode(format!("encode {} payload: {e}", self.name())))
    }
}

/// Arguments for starting a fresh research run.
///
/// `request_id` stays the same across retries of one start so the engine can
/// recognize a repeated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub run_id: String,
    pub task_queue: String,
    pub workflow_type: String,
    pub request_id: String,
    /// Set for a direct run that researches this query without clarifications.
    pub initial_query: Option<String>,
}

impl StartRequest {
    pub fn new(run_id: impl Into<String>, cfg: &EngineConfig) -> Self {
        Self {
            run_id: run_id.into(),
            task_queue: cfg.task_queue.clone(),
            workflow_type: cfg.workflow_type.clone(),
            request_id: gen_request_id(),
            initial_query: None,
        }
    }

    /// A run that researches `query` straight away and closes with the report.
    pub fn direct(run_id: impl Into<String>, query: &str, cfg: &EngineConfig) -> Self {
        Self {
            initial_query: Some(query.to_string()),
            ..Self::new(run_id, cfg)
        }
    }

    /// Positional run arguments: the initial query (absent for an interactive run)
    /// and whether clarifications are used, which is never the case here.
    pub fn initial_args(&self) -> serde_json::Value {
        serde_json::json!([self.initial_query, false])
    }
}

/// Capability set of one run, addressed by id.
#[async_trait]
pub trait RunHandle: Send + Sync {
    fn run_id(&self) -> &str;

    /// Reads the run's status snapshot. `None` means the run has no interaction yet.
    async fn query_status(&self) -> Result<Option<StatusSnapshot>, EngineError>;

    /// Applies an update and returns the snapshot observed right after it.
    async fn update(&self, update: RunUpdate) -> Result<StatusSnapshot, EngineError>;

    /// Fire-and-forget request for the run to end.
    async fn signal_end(&self) -> Result<(), EngineError>;

    async fn describe(&self) -> Result<ExecutionStatus, EngineError>;

    /// Blocks until the run closes and returns its output.
    async fn result(&self) -> Result<FinalResult, EngineError>;
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    type Handle: RunHandle;

    /// Looks up an existing run. Fails with [`EngineError::NotFound`] when the engine
    /// has no run under `run_id`.
    async fn get_handle(&self, run_id: &str) -> Result<Self::Handle, EngineError>;

    async fn start(&self, req: &StartRequest) -> Result<Self::Handle, EngineError>;
}

/// Random request identifier, so the engine can deduplicate retried calls.
pub(crate) fn gen_request_id() -> String {
    let mut b = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut b);
    b.iter().map(|x| format!("{x:02x}")).collect()
}
