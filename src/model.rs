use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Answer recorded when the user submits an empty clarification.
pub const NO_PREFERENCE: &str = "No specific preference";

/// Words that end the whole session when typed instead of an answer.
pub const EXIT_WORDS: [&str; 4] = ["exit", "quit", "end", "done"];

/// Returns true when `answer` (trimmed, case-insensitive) asks to leave the session.
pub fn is_exit_word(answer: &str) -> bool {
    let normalized = answer.trim().to_lowercase();
    EXIT_WORDS.iter().any(|w| *w == normalized)
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub engine: EngineConfig,
    pub driver: DriverConfig,
    pub workflow_id: String,
    pub start_timeout: Duration,
    pub start_retry_delay: Duration,
    pub result_retry_timeout: Duration,
    pub report_path: std::path::PathBuf,
}

/// Connection settings for the workflow engine's HTTP frontend.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    pub namespace: String,
    pub task_queue: String,
    pub workflow_type: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub long_poll_timeout: Duration,
    pub user_agent: String,
}

/// Delays used by the interactive polling loop.
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    /// Delay before re-polling when nothing observable changed.
    pub poll_interval: Duration,
    /// Delay for pending/unrecognized states and after a recovered failure.
    pub retry_delay: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Lifecycle status reported by the research run itself.
///
/// Unrecognized strings are kept in `Unknown` so callers can log them instead of
/// mistaking a new terminal state for an old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResearchStatus {
    Pending,
    AwaitingClarifications,
    CollectingAnswers,
    Researching,
    Completed,
    Failed,
    TimedOut,
    Terminated,
    Canceled,
    Unknown(String),
}

impl ResearchStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ResearchStatus::Pending => "pending",
            ResearchStatus::AwaitingClarifications => "awaiting_clarifications",
            ResearchStatus::CollectingAnswers => "collecting_answers",
            ResearchStatus::Researching => "researching",
            ResearchStatus::Completed => "completed",
            ResearchStatus::Failed => "failed",
            ResearchStatus::TimedOut => "timed_out",
            ResearchStatus::Terminated => "terminated",
            ResearchStatus::Canceled => "canceled",
            ResearchStatus::Unknown(s) => s,
        }
    }

    /// Terminal statuses never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResearchStatus::Completed
                | ResearchStatus::Failed
                | ResearchStatus::TimedOut
                | ResearchStatus::Terminated
                | ResearchStatus::Canceled
        )
    }

    /// Statuses in which the run accepts clarification answers.
    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            ResearchStatus::AwaitingClarifications | ResearchStatus::CollectingAnswers
        )
    }
}

impl From<String> for ResearchStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => ResearchStatus::Pending,
            "awaiting_clarifications" => ResearchStatus::AwaitingClarifications,
            "collecting_answers" => ResearchStatus::CollectingAnswers,
            "researching" => ResearchStatus::Researching,
            "completed" => ResearchStatus::Completed,
            "failed" => ResearchStatus::Failed,
            "timed_out" => ResearchStatus::TimedOut,
            "terminated" => ResearchStatus::Terminated,
            "canceled" | "cancelled" => ResearchStatus::Canceled,
            _ => ResearchStatus::Unknown(s),
        }
    }
}

impl From<ResearchStatus> for String {
    fn from(s: ResearchStatus) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for ResearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a research run, as returned by the status query and
/// by every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: ResearchStatus,
    #[serde(default)]
    pub original_query: Option<String>,
    #[serde(default)]
    pub clarification_questions: Option<Vec<String>>,
    #[serde(default)]
    pub clarification_responses: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub current_question_index: Option<usize>,
    #[serde(default)]
    pub final_result: Option<serde_json::Value>,
}

impl StatusSnapshot {
    pub fn new(status: ResearchStatus) -> Self {
        Self {
            status,
            original_query: None,
            clarification_questions: None,
            clarification_responses: None,
            current_question_index: None,
            final_result: None,
        }
    }

    /// The question awaiting an answer, or `None` once every question of this
    /// round has been answered.
    pub fn current_question(&self) -> Option<&str> {
        let idx = self.current_question_index?;
        self.clarification_questions
            .as_ref()?
            .get(idx)
            .map(String::as_str)
    }

    pub fn question_count(&self) -> usize {
        self.clarification_questions.as_ref().map_or(0, Vec::len)
    }

    pub fn has_final_result(&self) -> bool {
        self.final_result.as_ref().is_some_and(|v| !v.is_null())
    }
}

/// Initial research query, submitted once to move a run out of `pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQueryInput {
    pub query: String,
}

/// One answer to the question at `question_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationAnswer {
    pub question_index: usize,
    pub answer: String,
}

impl ClarificationAnswer {
    /// Trims the raw answer and substitutes [`NO_PREFERENCE`] for empty input.
    pub fn from_input(question_index: usize, raw: &str) -> Self {
        let trimmed = raw.trim();
        let answer = if trimmed.is_empty() {
            NO_PREFERENCE.to_string()
        } else {
            trimmed.to_string()
        };
        Self {
            question_index,
            answer,
        }
    }
}

/// Batch of answers keyed by opaque identifiers such as `question_0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationBatch {
    pub responses: BTreeMap<String, String>,
}

/// Structured output of a research run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchReport {
    #[serde(default)]
    pub short_summary: String,
    pub markdown_report: String,
    #[serde(default)]
    pub follow_up_questions: Vec<String>,
    #[serde(default)]
    pub pdf_file_path: Option<String>,
}

/// What a finished run returned: a structured report, or a plain message such as
/// the notice left when the user ended the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FinalResult {
    Report(ResearchReport),
    Text(String),
}

impl FinalResult {
    /// Normalizes plain text into a report with the text as its markdown body.
    pub fn into_report(self) -> ResearchReport {
        match self {
            FinalResult::Report(r) => r,
            FinalResult::Text(markdown_report) => ResearchReport {
                short_summary: String::new(),
                markdown_report,
                follow_up_questions: Vec::new(),
                pdf_file_path: None,
            },
        }
    }
}
