use crate::console::{Console, StdConsole};
use crate::engine::temporal::TemporalClient;
use crate::model::{DriverConfig, EngineConfig, RunConfig};
use crate::orchestrator::{self, SessionOutcome};
use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "interactive-research",
    version,
    about = "Drive an interactive research workflow: answer its clarifying questions and collect the report"
)]
pub struct Cli {
    /// Research query (prompted for when omitted)
    pub query: Option<String>,

    /// Workflow ID to resume or derive a new session from
    #[arg(long, default_value = "interactive-research-workflow")]
    pub workflow_id: String,

    /// Force a new session with a unique workflow ID
    #[arg(long)]
    pub new_session: bool,

    /// Research the query in one run without clarifying questions
    #[arg(long, conflicts_with_all = ["status", "clarify"])]
    pub direct: bool,

    /// Print the status of an existing workflow and exit
    #[arg(long)]
    pub status: bool,

    /// Send clarification responses and exit (e.g. --clarify question_0='travel budget' question_1=March)
    #[arg(long, num_args = 1.., value_name = "KEY=VALUE")]
    pub clarify: Option<Vec<String>>,

    /// Base URL of the workflow engine's HTTP API
    #[arg(long, env = "RESEARCH_ENGINE_URL", default_value = "http://localhost:7243")]
    pub engine_url: String,

    /// Engine namespace holding the research workflows
    #[arg(long, env = "RESEARCH_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Task queue new runs are started on
    #[arg(long, default_value = "openai-agents-task-queue")]
    pub task_queue: String,

    /// Workflow type started for new runs
    #[arg(long, default_value = "InteractiveResearchWorkflow")]
    pub workflow_type: String,

    /// Bearer token sent to the engine
    #[arg(long, env = "RESEARCH_ENGINE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Timeout for a single engine request
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// Timeout for one long-poll while waiting for the final result
    #[arg(long, default_value = "90s")]
    pub long_poll_timeout: humantime::Duration,

    /// Delay before re-polling when nothing changed
    #[arg(long, default_value = "1s")]
    pub poll_interval: humantime::Duration,

    /// Delay while the run is pending and after a recovered error
    #[arg(long, default_value = "2s")]
    pub retry_delay: humantime::Duration,

    /// How long starting a new run is retried
    #[arg(long, default_value = "5m")]
    pub start_timeout: humantime::Duration,

    /// Delay between start attempts
    #[arg(long, default_value = "5s")]
    pub start_retry_delay: humantime::Duration,

    /// How long fetching the final result is retried while the engine is unreachable
    #[arg(long, default_value = "5m")]
    pub result_retry_timeout: humantime::Duration,

    /// Where the markdown report is written
    #[arg(long, default_value = "interactive_research_report.md")]
    pub report_path: std::path::PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

/// Which operation this invocation performs.
#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Status,
    Clarify(BTreeMap<String, String>),
    Session(Option<String>),
}

impl Cli {
    fn mode(&self) -> Mode {
        if self.status {
            Mode::Status
        } else if let Some(entries) = self.clarify.as_deref() {
            Mode::Clarify(parse_clarifications(entries))
        } else {
            Mode::Session(self.query.clone())
        }
    }
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> RunConfig {
    RunConfig {
        engine: EngineConfig {
            base_url: args.engine_url.clone(),
            namespace: args.namespace.clone(),
            task_queue: args.task_queue.clone(),
            workflow_type: args.workflow_type.clone(),
            api_key: args.api_key.clone().filter(|k| !k.trim().is_empty()),
            request_timeout: Duration::from(args.request_timeout),
            long_poll_timeout: Duration::from(args.long_poll_timeout),
            user_agent: format!("interactive-research-cli/{}", env!("CARGO_PKG_VERSION")),
        },
        driver: DriverConfig {
            poll_interval: Duration::from(args.poll_interval),
            retry_delay: Duration::from(args.retry_delay),
        },
        workflow_id: args.workflow_id.clone(),
        start_timeout: Duration::from(args.start_timeout),
        start_retry_delay: Duration::from(args.start_retry_delay),
        result_retry_timeout: Duration::from(args.result_retry_timeout),
        report_path: args.report_path.clone(),
    }
}

/// `KEY=VALUE` entries into a response map. Entries without `=` are skipped and the
/// value is everything after the first `=`.
pub fn parse_clarifications(entries: &[String]) -> BTreeMap<String, String> {
    entries
        .iter()
        .filter_map(|e| e.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Prompts for the research query. `None` when it is empty or input is closed.
async fn read_query(console: &mut dyn Console) -> Result<Option<String>> {
    console.say("Interactive Research Workflow");
    console.say(&"=".repeat(40));
    let query = console
        .ask("Enter your research query: ")
        .await?
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty());
    if query.is_none() {
        console.warn("Query cannot be empty");
    }
    Ok(query)
}

pub async fn run(args: Cli) -> Result<()> {
    let mut console = StdConsole::new();
    let res = until_interrupted(dispatch(&args, &mut console), tokio::signal::ctrl_c()).await;
    console.finish().await;
    res
}

/// Runs `work` unless `interrupt` fires first. An interrupt source that fails to
/// install never cancels the work.
async fn until_interrupted<W, I>(work: W, interrupt: I) -> Result<()>
where
    W: Future<Output = Result<()>>,
    I: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        res = work => res,
        Ok(()) = interrupt => {
            tracing::info!("interrupted");
            Err(anyhow::anyhow!("interrupted, the research session was left open"))
        }
    }
}

async fn dispatch(args: &Cli, console: &mut StdConsole) -> Result<()> {
    let cfg = build_config(args);

    let mode = match args.mode() {
        Mode::Session(None) => match read_query(console).await? {
            Some(q) => Mode::Session(Some(q)),
            None => return Ok(()),
        },
        mode => mode,
    };

    let client = connect(&cfg, console).await?;

    match mode {
        Mode::Status => {
            orchestrator::get_status(&client, &cfg.workflow_id, console).await;
            Ok(())
        }
        Mode::Clarify(responses) => {
            orchestrator::send_clarifications(&client, &cfg.workflow_id, responses, console)
                .await;
            Ok(())
        }
        Mode::Session(query) => {
            let query = query.unwrap_or_default();
            // A direct run always gets its own id; it never resumes anything.
            let run_id = if args.new_session || args.direct {
                let id = orchestrator::unique_run_id(&cfg.workflow_id);
                console.say(&format!("Using new session ID: {id}"));
                id
            } else {
                cfg.workflow_id.clone()
            };

            let outcome = if args.direct {
                orchestrator::run_direct(&client, console, &cfg, &run_id, &query)
                    .await
                    .context("research run failed")?
            } else {
                orchestrator::run_session(&client, console, &cfg, &run_id, &query)
                    .await
                    .context("research session failed")?
            };
            match outcome {
                SessionOutcome::Completed { report, saved_to } => {
                    tracing::info!(
                        follow_ups = report.follow_up_questions.len(),
                        saved_to = ?saved_to,
                        "research completed"
                    );
                }
                SessionOutcome::EndedByUser => tracing::info!("session ended by user"),
                SessionOutcome::InputClosed => tracing::info!("session left open, input closed"),
            }
            Ok(())
        }
    }
}

/// Builds the engine client and checks it answers once.
async fn connect(cfg: &RunConfig, console: &mut dyn Console) -> Result<TemporalClient> {
    let client = TemporalClient::new(&cfg.engine)?;
    match client.check_connection().await {
        Ok(()) => {
            console.say("Connected to the workflow engine");
            Ok(client)
        }
        Err(e) => {
            console.warn(&format!("Failed to connect to the workflow engine: {e}"));
            console.warn(&format!(
                "   Make sure the engine is running at {}",
                cfg.engine.base_url
            ));
            Err(e).context("workflow engine not reachable")
        }
    }
}
