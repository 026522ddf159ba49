//! Single round-trip modes: `--status` and `--clarify`.
//!
//! Failures here are reported on the console and never fail the process.

use crate::console::Console;
use crate::engine::{EngineError, RunHandle, RunUpdate, WorkflowEngine};
use crate::model::{ClarificationBatch, StatusSnapshot};
use crate::text_summary::build_status_summary;
use std::collections::BTreeMap;

/// Prints the run's current snapshot and returns it.
pub(crate) async fn get_status<E: WorkflowEngine>(
    engine: &E,
    run_id: &str,
    console: &mut dyn Console,
) -> Option<StatusSnapshot> {
    let fetched: Result<Option<StatusSnapshot>, EngineError> = async {
        let handle = engine.get_handle(run_id).await?;
        handle.query_status().await
    }
    .await;

    match fetched {
        Ok(snapshot) => {
            for line in build_status_summary(run_id, snapshot.as_ref()).lines {
                console.say(&line);
            }
            snapshot
        }
        Err(e) => {
            tracing::debug!(run_id, error = %e, "status lookup failed");
            console.warn(&format!("Error getting workflow status: {e}"));
            None
        }
    }
}

/// Sends every response in one batch update and prints the resulting status.
pub(crate) async fn send_clarifications<E: WorkflowEngine>(
    engine: &E,
    run_id: &str,
    responses: BTreeMap<String, String>,
    console: &mut dyn Console,
) -> Option<StatusSnapshot> {
    let sent: Result<StatusSnapshot, EngineError> = async {
        let handle = engine.get_handle(run_id).await?;
        handle
            .update(RunUpdate::Clarifications(ClarificationBatch { responses }))
            .await
    }
    .await;

    match sent {
        Ok(snapshot) => {
            console.say(&format!("Clarifications sent to workflow {run_id}"));
            console.say(&format!("Updated status: {}", snapshot.status));
            Some(snapshot)
        }
        Err(e) => {
            tracing::debug!(run_id, error = %e, "batch clarification failed");
            console.warn(&format!("Error sending clarifications: {e}"));
            None
        }
    }
}
