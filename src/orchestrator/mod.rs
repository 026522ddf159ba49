//! Session orchestration.
//!
//! This module owns the run lifecycle (resolve or start, submit the query, drive the
//! clarification loop, wait for the result) and the single round-trip modes. The CLI
//! layer calls into it with a configured engine and console.

mod driver;
mod oneshot;
mod post_process;
mod resolve;

pub(crate) use oneshot::{get_status, send_clarifications};
pub(crate) use post_process::SessionOutcome;
pub(crate) use resolve::unique_run_id;

use crate::console::Console;
use crate::engine::{RunHandle, StartRequest, WorkflowEngine};
use crate::model::RunConfig;
use crate::text_summary::research_progress_lines;
use anyhow::{bail, Result};
use driver::{LoopExit, SessionDriver};
use resolve::StartPolicy;

/// Runs one interactive research session for `query` against `run_id`.
pub(crate) async fn run_session<E: WorkflowEngine>(
    engine: &E,
    console: &mut dyn Console,
    cfg: &RunConfig,
    run_id: &str,
    query: &str,
) -> Result<SessionOutcome> {
    console.say(&format!("Starting interactive research: {query}"));

    let handle =
        resolve::resolve_or_start(engine, run_id, &cfg.engine, start_policy(cfg), console).await?;
    tracing::info!(run_id = handle.run_id(), "session attached");

    resolve::ensure_started(&handle, query, console).await?;

    let exit = SessionDriver::new(&handle, console, cfg.driver)
        .interactive_loop()
        .await?;
    match exit {
        LoopExit::AwaitResult => {}
        LoopExit::EndedByUser => return Ok(SessionOutcome::EndedByUser),
        LoopExit::InputClosed => return Ok(SessionOutcome::InputClosed),
        LoopExit::RunTerminal(status) => {
            bail!("workflow {} ended with status {status}", handle.run_id())
        }
        LoopExit::EngineStopped(exec) => {
            bail!("workflow {} is no longer running ({exec})", handle.run_id())
        }
    }

    let result = post_process::await_final_result(&handle, cfg.result_retry_timeout).await?;
    Ok(post_process::present_report(result, &cfg.report_path, console))
}

/// Researches `query` in one fresh run without clarifying questions and presents
/// the report once the run closes.
pub(crate) async fn run_direct<E: WorkflowEngine>(
    engine: &E,
    console: &mut dyn Console,
    cfg: &RunConfig,
    run_id: &str,
    query: &str,
) -> Result<SessionOutcome> {
    console.say(&format!("Starting research: {query}"));
    let req = StartRequest::direct(run_id, query, &cfg.engine);
    let handle = resolve::start_with_retry(engine, &req, start_policy(cfg)).await?;
    tracing::info!(run_id = handle.run_id(), "direct run started");
    for line in research_progress_lines() {
        console.say(&line);
    }

    let result = post_process::await_final_result(&handle, cfg.result_retry_timeout).await?;
    Ok(post_process::present_report(result, &cfg.report_path, console))
}

fn start_policy(cfg: &RunConfig) -> StartPolicy {
    StartPolicy {
        timeout: cfg.start_timeout,
        retry_delay: cfg.start_retry_delay,
    }
}
