//! Post-run processing: wait for the run's output, persist the report and present it.

use crate::console::Console;
use crate::engine::RunHandle;
use crate::model::{FinalResult, ResearchReport};
use crate::text_summary::build_report_summary;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

const RESULT_BACKOFF_START: Duration = Duration::from_secs(2);
const RESULT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// How an interactive session ended.
#[derive(Debug)]
pub(crate) enum SessionOutcome {
    /// The run finished and its report was presented.
    Completed {
        report: ResearchReport,
        saved_to: Option<PathBuf>,
    },
    /// The user ended the session; no result was fetched.
    EndedByUser,
    /// Input closed mid-session; the run was left as it was.
    InputClosed,
}

/// Blocks until the run has closed and returns its output.
///
/// Only transient failures are retried, with a growing delay, and only for
/// `retry_timeout`; anything else (including a failed run) is returned at once.
pub(crate) async fn await_final_result<H: RunHandle + ?Sized>(
    handle: &H,
    retry_timeout: Duration,
) -> Result<FinalResult> {
    // A timeout past the end of time means no deadline.
    let deadline = Instant::now().checked_add(retry_timeout);
    let mut delay = RESULT_BACKOFF_START;
    loop {
        match handle.result().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && deadline.map_or(true, |d| Instant::now() < d) => {
                tracing::debug!(run_id = handle.run_id(), error = %e, ?delay, "result wait failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(1.5).min(RESULT_BACKOFF_MAX);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("no result from workflow {}", handle.run_id()))
            }
        }
    }
}

/// Writes the markdown report to `path`.
pub(crate) fn save_report(path: &Path, report: &ResearchReport) -> Result<()> {
    std::fs::write(path, &report.markdown_report)
        .with_context(|| format!("failed to write report to {}", path.display()))
}

/// Saves the report and prints the completion view. A failed save is reported
/// but does not hide the report itself.
pub(crate) fn present_report(
    result: FinalResult,
    report_path: &Path,
    console: &mut dyn Console,
) -> SessionOutcome {
    let report = result.into_report();
    let saved_to = match save_report(report_path, &report) {
        Ok(()) => Some(report_path.to_path_buf()),
        Err(e) => {
            tracing::warn!(error = %e, "report not saved");
            console.warn(&format!("Could not save report: {e:#}"));
            None
        }
    };

    for line in build_report_summary(&report, saved_to.as_deref()).lines {
        console.say(&line);
    }
    SessionOutcome::Completed { report, saved_to }
}
