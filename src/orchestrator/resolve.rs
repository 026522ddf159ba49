//! Run resolution: attach to a live run or start a fresh one, then make sure the
//! research query has been submitted exactly once.

use crate::console::Console;
use crate::engine::{EngineError, RunHandle, RunUpdate, StartRequest, WorkflowEngine};
use crate::model::{EngineConfig, ResearchStatus, UserQueryInput};
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::time::Instant;

/// How long and how often a failed start is retried.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StartPolicy {
    pub timeout: Duration,
    pub retry_delay: Duration,
}

/// `now + delay` lands before `deadline`. No deadline means retry forever; a sum
/// past the end of time never fits.
fn fits_before(deadline: Option<Instant>, delay: Duration) -> bool {
    match deadline {
        None => true,
        Some(d) => Instant::now().checked_add(delay).is_some_and(|t| t < d),
    }
}

/// `base` suffixed with the current unix time, for sessions that must not reuse
/// an earlier run's id.
pub(crate) fn unique_run_id(base: &str) -> String {
    format!("{base}-{}", time::OffsetDateTime::now_utc().unix_timestamp())
}

/// Outcome of looking up a run under the requested id.
enum Lookup<H> {
    Resume(H),
    StartFresh,
}

async fn lookup_existing<E: WorkflowEngine>(
    engine: &E,
    run_id: &str,
    console: &mut dyn Console,
) -> Result<Lookup<E::Handle>> {
    let handle = match engine.get_handle(run_id).await {
        Ok(h) => h,
        Err(EngineError::NotFound { .. }) => {
            console.say("Workflow not found, will start a new one...");
            return Ok(Lookup::StartFresh);
        }
        Err(e) if e.is_transient() => {
            // An unreachable engine says nothing about the run; starting another one
            // here could duplicate a live session.
            return Err(e).context(format!("could not look up workflow {run_id}"));
        }
        Err(e) => {
            tracing::warn!(run_id, error = %e, "run lookup failed");
            console.say("Could not look up existing workflow, will start a new one...");
            return Ok(Lookup::StartFresh);
        }
    };

    console.say("Checking if workflow is already running...");
    match handle.query_status().await {
        Ok(Some(s)) if !s.status.is_terminal() => {
            console.say("Found existing running workflow, using it...");
            tracing::info!(run_id, status = %s.status, "resuming run");
            Ok(Lookup::Resume(handle))
        }
        Ok(Some(s)) => {
            console.say(&format!(
                "Existing workflow is not running (status: {}), will start a new one...",
                s.status
            ));
            Ok(Lookup::StartFresh)
        }
        Ok(None) => {
            // No interaction yet: the run is resumable only while the engine still runs it.
            match handle.describe().await {
                Ok(exec) if exec.is_running() => {
                    console.say("Found existing workflow waiting for a query, using it...");
                    Ok(Lookup::Resume(handle))
                }
                Ok(exec) => {
                    console.say(&format!(
                        "Existing workflow has status {exec}, will start a new one..."
                    ));
                    Ok(Lookup::StartFresh)
                }
                Err(e) if e.is_transient() => {
                    Err(e).context(format!("could not describe workflow {run_id}"))
                }
                Err(_) => {
                    console.say("Could not query existing workflow, will start a new one...");
                    Ok(Lookup::StartFresh)
                }
            }
        }
        Err(e) if e.is_transient() => {
            Err(e).context(format!("could not query workflow {run_id}"))
        }
        Err(e) => {
            tracing::warn!(run_id, error = %e, "status query on existing run failed");
            console.say("Could not query existing workflow, will start a new one...");
            Ok(Lookup::StartFresh)
        }
    }
}

/// Starts `req`, retrying transient failures until `policy.timeout` elapses.
pub(crate) async fn start_with_retry<E: WorkflowEngine>(
    engine: &E,
    req: &StartRequest,
    policy: StartPolicy,
) -> Result<E::Handle> {
    let deadline = Instant::now().checked_add(policy.timeout);
    let mut retried = false;
    loop {
        match engine.start(req).await {
            Ok(h) => return Ok(h),
            // An earlier attempt reached the engine even though its reply was lost.
            Err(EngineError::AlreadyStarted { .. }) if retried => {
                tracing::info!(run_id = %req.run_id, "start already applied by an earlier attempt");
                return engine
                    .get_handle(&req.run_id)
                    .await
                    .with_context(|| format!("failed to attach to started run {}", req.run_id));
            }
            Err(e) if e.is_transient() && fits_before(deadline, policy.retry_delay) => {
                tracing::warn!(run_id = %req.run_id, error = %e, "start failed, retrying");
                retried = true;
                tokio::time::sleep(policy.retry_delay).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to start workflow {}", req.run_id))
            }
        }
    }
}

/// Returns a handle to a resumable run under `run_id`, or starts exactly one new
/// run under a fresh id derived from it.
pub(crate) async fn resolve_or_start<E: WorkflowEngine>(
    engine: &E,
    run_id: &str,
    cfg: &EngineConfig,
    policy: StartPolicy,
    console: &mut dyn Console,
) -> Result<E::Handle> {
    if let Lookup::Resume(handle) = lookup_existing(engine, run_id, console).await? {
        return Ok(handle);
    }

    let fresh = unique_run_id(run_id);
    console.say(&format!("Starting new research workflow: {fresh}"));
    let req = StartRequest::new(fresh, cfg);
    start_with_retry(engine, &req, policy).await
}

/// Submits the research query if the run has not received one yet. Returns whether
/// the query was submitted by this call.
pub(crate) async fn ensure_started<H: RunHandle + ?Sized>(
    handle: &H,
    query: &str,
    console: &mut dyn Console,
) -> Result<bool> {
    let current = handle
        .query_status()
        .await
        .with_context(|| format!("failed to read status of workflow {}", handle.run_id()))?;

    match current {
        Some(s) if s.status != ResearchStatus::Pending => {
            tracing::debug!(run_id = handle.run_id(), status = %s.status, "query already submitted");
            Ok(false)
        }
        _ => {
            console.say(&format!("Initiating research for: {query}"));
            let snap = handle
                .update(RunUpdate::StartResearch(UserQueryInput {
                    query: query.to_string(),
                }))
                .await
                .context("failed to submit research query")?;
            tracing::info!(run_id = handle.run_id(), status = %snap.status, "research query submitted");
            Ok(true)
        }
    }
}
