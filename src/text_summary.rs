//! Text summary builders for CLI output.
//!
//! This module formats human-readable lines for run status and the final report.

use crate::model::{ResearchReport, StatusSnapshot};
use std::path::Path;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Lines shown once the run has moved past clarifications into research.
pub(crate) fn research_progress_lines() -> Vec<String> {
    vec![
        String::new(),
        "Research in progress...".to_string(),
        "   Planning searches".to_string(),
        "   Gathering information from sources".to_string(),
        "   Compiling report".to_string(),
        "   Please wait...".to_string(),
    ]
}

/// Status view for `--status`.
pub(crate) fn build_status_summary(run_id: &str, snapshot: Option<&StatusSnapshot>) -> TextSummary {
    let Some(s) = snapshot else {
        return TextSummary {
            lines: vec![format!("No status available for workflow {run_id}")],
        };
    };

    let mut lines = vec![format!("Workflow {run_id} status: {}", s.status)];
    if let Some(q) = s.original_query.as_deref().filter(|q| !q.trim().is_empty()) {
        lines.push(format!("Query: {q}"));
    }
    let total = s.question_count();
    if total > 0 {
        lines.push(format!("Pending questions: {total}"));
        let answered = s.current_question_index.unwrap_or(0).min(total);
        lines.push(format!("Answered: {answered}/{total}"));
        if let Some(q) = s.current_question().filter(|_| s.status.is_interactive()) {
            lines.push(format!("Current question: {q}"));
        }
    }
    if s.has_final_result() {
        lines.push("Has final result".to_string());
    }
    TextSummary { lines }
}

/// Completion view: saved path, PDF note, summary, follow-ups and the full report.
pub(crate) fn build_report_summary(report: &ResearchReport, saved_to: Option<&Path>) -> TextSummary {
    let mut lines = vec![String::new(), "Research completed!".to_string()];

    if let Some(path) = saved_to {
        lines.push(format!("Markdown report saved to: {}", path.display()));
    }
    match report.pdf_file_path.as_deref().filter(|p| !p.is_empty()) {
        Some(pdf) => lines.push(format!("PDF report saved to: {pdf}")),
        None => lines.push("PDF generation not available (continuing with markdown only)".into()),
    }

    if !report.short_summary.trim().is_empty() {
        lines.push(String::new());
        lines.push(format!("Summary: {}", report.short_summary));
    }

    if !report.follow_up_questions.is_empty() {
        lines.push(String::new());
        lines.push("Follow-up questions:".to_string());
        for (i, q) in report.follow_up_questions.iter().enumerate() {
            lines.push(format!("   {}. {}", i + 1, q));
        }
    }

    lines.push(String::new());
    lines.push("Research Result:".to_string());
    lines.push("=".repeat(60));
    lines.extend(report.markdown_report.lines().map(str::to_string));

    TextSummary { lines }
}
