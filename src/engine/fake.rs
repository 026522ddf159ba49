//! In-memory engine for driver tests. Mirrors how the research run reacts to each
//! update and records every call so tests can assert on the exact sequence.

use super::{EngineError, ExecutionStatus, RunHandle, RunUpdate, StartRequest, WorkflowEngine};
use crate::model::{FinalResult, ResearchReport, ResearchStatus, StatusSnapshot};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    GetHandle(String),
    Start(String),
    Query(String),
    Update(String, RunUpdate),
    Signal(String),
    Describe(String),
    Result(String),
}

#[derive(Debug, Clone)]
pub(crate) struct FakeRun {
    pub snapshot: Option<StatusSnapshot>,
    pub execution: ExecutionStatus,
    /// Snapshots returned by the next queries before falling back to `snapshot`.
    pub scripted: VecDeque<StatusSnapshot>,
    /// Number of upcoming queries that fail, and the HTTP status they fail with.
    pub failing_queries: usize,
    pub query_failure_status: u16,
    /// Number of upcoming result waits that fail with a 503.
    pub failing_results: usize,
    pub result: Option<FinalResult>,
}

impl FakeRun {
    pub fn pending() -> Self {
        Self {
            snapshot: None,
            execution: ExecutionStatus::Running,
            scripted: VecDeque::new(),
            failing_queries: 0,
            query_failure_status: 503,
            failing_results: 0,
            result: None,
        }
    }

    pub fn with_status(status: ResearchStatus) -> Self {
        let execution = match status {
            ResearchStatus::Completed => ExecutionStatus::Completed,
            ResearchStatus::Failed => ExecutionStatus::Failed,
            ResearchStatus::TimedOut => ExecutionStatus::TimedOut,
            ResearchStatus::Terminated => ExecutionStatus::Terminated,
            ResearchStatus::Canceled => ExecutionStatus::Canceled,
            _ => ExecutionStatus::Running,
        };
        Self {
            snapshot: Some(StatusSnapshot::new(status)),
            execution,
            ..Self::pending()
        }
    }
}

#[derive(Default)]
struct State {
    runs: HashMap<String, FakeRun>,
    calls: Vec<Call>,
    questions: Vec<String>,
    report: Option<ResearchReport>,
    unreachable: bool,
    failing_starts: usize,
    start_failure_status: Option<u16>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeEngine {
    state: Arc<Mutex<State>>,
}

impl FakeEngine {
    /// Engine whose new runs ask `questions` once research starts.
    pub fn with_questions(questions: &[&str]) -> Self {
        let engine = Self::default();
        {
            let mut st = engine.lock();
            st.questions = questions.iter().map(|q| q.to_string()).collect();
            st.report = Some(ResearchReport {
                short_summary: "summary".into(),
                markdown_report: "# Report".into(),
                follow_up_questions: vec!["What next?".into()],
                pdf_file_path: None,
            });
        }
        engine
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_run(&self, run_id: &str, run: FakeRun) {
        self.lock().runs.insert(run_id.to_string(), run);
    }

    pub fn run(&self, run_id: &str) -> Option<FakeRun> {
        self.lock().runs.get(run_id).cloned()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// The next `n` starts fail as unreachable.
    pub fn fail_next_starts(&self, n: usize) {
        let mut st = self.lock();
        st.failing_starts = n;
        st.start_failure_status = None;
    }

    /// The next `n` starts are rejected with HTTP `status`.
    pub fn reject_next_starts(&self, n: usize, status: u16) {
        let mut st = self.lock();
        st.failing_starts = n;
        st.start_failure_status = Some(status);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Start(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn updates(&self) -> Vec<RunUpdate> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Update(_, u) => Some(u),
                _ => None,
            })
            .collect()
    }

    fn handle(&self, run_id: &str) -> FakeHandle {
        FakeHandle {
            engine: self.clone(),
            run_id: run_id.to_string(),
        }
    }
}

fn unreachable() -> EngineError {
    EngineError::Unreachable {
        url: "fake://engine".into(),
        message: "connection refused".into(),
    }
}

fn rejected(status: u16, message: &str) -> EngineError {
    EngineError::Rejected {
        status,
        url: "fake://engine".into(),
        message: message.into(),
    }
}

#[async_trait]
impl WorkflowEngine for FakeEngine {
    type Handle = FakeHandle;

    async fn get_handle(&self, run_id: &str) -> Result<FakeHandle, EngineError> {
        let mut st = self.lock();
        st.calls.push(Call::GetHandle(run_id.to_string()));
        if st.unreachable {
            return Err(unreachable());
        }
        if !st.runs.contains_key(run_id) {
            return Err(EngineError::NotFound {
                run_id: run_id.to_string(),
            });
        }
        drop(st);
        Ok(self.handle(run_id))
    }

    async fn start(&self, req: &StartRequest) -> Result<FakeHandle, EngineError> {
        let mut st = self.lock();
        st.calls.push(Call::Start(req.run_id.clone()));
        if st.failing_starts > 0 {
            st.failing_starts -= 1;
            return Err(match st.start_failure_status {
                Some(status) => rejected(status, "start failed"),
                None => unreachable(),
            });
        }
        if st.runs.contains_key(&req.run_id) {
            return Err(EngineError::AlreadyStarted {
                run_id: req.run_id.clone(),
            });
        }
        let run = match &req.initial_query {
            // A direct run researches without clarifications and closes with the report.
            Some(_) => FakeRun {
                execution: ExecutionStatus::Completed,
                result: st.report.clone().map(FinalResult::Report),
                ..FakeRun::pending()
            },
            None => FakeRun::pending(),
        };
        st.runs.insert(req.run_id.clone(), run);
        drop(st);
        Ok(self.handle(&req.run_id))
    }
}

pub struct FakeHandle {
    engine: FakeEngine,
    run_id: String,
}

impl FakeHandle {
    fn with_run<T>(
        &self,
        call: Call,
        f: impl FnOnce(&mut FakeRun, &State) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut st = self.engine.lock();
        st.calls.push(call);
        if st.unreachable {
            return Err(unreachable());
        }
        let mut run = st.runs.remove(&self.run_id).ok_or_else(|| EngineError::NotFound {
            run_id: self.run_id.clone(),
        })?;
        let out = f(&mut run, &st);
        st.runs.insert(self.run_id.clone(), run);
        out
    }
}

fn apply_update(run: &mut FakeRun, st: &State, update: &RunUpdate) -> Result<StatusSnapshot, EngineError> {
    let rejected = |message: String| EngineError::UpdateRejected {
        name: update.name(),
        message,
    };
    match update {
        RunUpdate::StartResearch(input) => {
            let mut snap = StatusSnapshot::new(ResearchStatus::AwaitingClarifications);
            snap.original_query = Some(input.query.clone());
            if st.questions.is_empty() {
                snap.status = ResearchStatus::Completed;
                run.result = st.report.clone().map(FinalResult::Report);
                run.execution = ExecutionStatus::Completed;
            } else {
                snap.clarification_questions = Some(st.questions.clone());
                snap.current_question_index = Some(0);
            }
            run.snapshot = Some(snap);
        }
        RunUpdate::SingleClarification(answer) => {
            let snap = run
                .snapshot
                .as_mut()
                .ok_or_else(|| rejected("No active research interaction".into()))?;
            if !snap.status.is_interactive() {
                return Err(rejected(format!("Not collecting clarifications: {}", snap.status)));
            }
            if answer.answer.trim().is_empty() {
                return Err(rejected("Answer cannot be empty".into()));
            }
            let idx = snap.current_question_index.unwrap_or(0);
            snap.clarification_responses
                .get_or_insert_with(BTreeMap::new)
                .insert(format!("question_{idx}"), answer.answer.clone());
            snap.current_question_index = Some(idx + 1);
            snap.status = if idx + 1 >= snap.question_count() {
                run.result = st.report.clone().map(FinalResult::Report);
                ResearchStatus::Researching
            } else {
                ResearchStatus::CollectingAnswers
            };
        }
        RunUpdate::Clarifications(batch) => {
            let snap = run
                .snapshot
                .as_mut()
                .ok_or_else(|| rejected("No active research interaction".into()))?;
            if snap.status != ResearchStatus::AwaitingClarifications {
                return Err(rejected(format!("Not awaiting clarifications: {}", snap.status)));
            }
            snap.clarification_responses = Some(batch.responses.clone());
            snap.current_question_index = Some(snap.question_count());
            snap.status = ResearchStatus::Researching;
            run.result = st.report.clone().map(FinalResult::Report);
        }
    }
    run.snapshot
        .clone()
        .ok_or_else(|| EngineError::Decode("no snapshot".into()))
}

#[async_trait]
impl RunHandle for FakeHandle {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    async fn query_status(&self) -> Result<Option<StatusSnapshot>, EngineError> {
        self.with_run(Call::Query(self.run_id.clone()), |run, _| {
            if run.failing_queries > 0 {
                run.failing_queries -= 1;
                return Err(rejected(run.query_failure_status, "query failed"));
            }
            if let Some(next) = run.scripted.pop_front() {
                return Ok(Some(next));
            }
            Ok(run.snapshot.clone())
        })
    }

    async fn update(&self, update: RunUpdate) -> Result<StatusSnapshot, EngineError> {
        let call = Call::Update(self.run_id.clone(), update.clone());
        self.with_run(call, |run, st| apply_update(run, st, &update))
    }

    async fn signal_end(&self) -> Result<(), EngineError> {
        self.with_run(Call::Signal(self.run_id.clone()), |run, _| {
            run.execution = ExecutionStatus::Completed;
            run.result = Some(FinalResult::Text("Research workflow ended by user".into()));
            Ok(())
        })
    }

    async fn describe(&self) -> Result<ExecutionStatus, EngineError> {
        self.with_run(Call::Describe(self.run_id.clone()), |run, _| Ok(run.execution))
    }

    async fn result(&self) -> Result<FinalResult, EngineError> {
        let run_id = self.run_id.clone();
        self.with_run(Call::Result(self.run_id.clone()), |run, _| {
            if run.failing_results > 0 {
                run.failing_results -= 1;
                return Err(rejected(503, "service unavailable"));
            }
            if !run.execution.is_running() && run.execution != ExecutionStatus::Completed {
                return Err(EngineError::RunFailed {
                    run_id,
                    status: run.execution,
                    message: "run did not complete".into(),
                });
            }
            run.result
                .clone()
                .ok_or_else(|| EngineError::Decode("run has no result yet".into()))
        })
    }
}
