//! Interactive polling loop.
//!
//! The loop is a small state machine: every iteration consumes one [`Step`] and
//! produces the next, so each engine call and each delay is an explicit
//! suspension point and the loop can only end through [`Step::Exit`].

use crate::console::Console;
use crate::engine::{EngineError, ExecutionStatus, RunHandle, RunUpdate};
use crate::model::{is_exit_word, ClarificationAnswer, DriverConfig, ResearchStatus, StatusSnapshot};
use crate::text_summary::research_progress_lines;
use anyhow::{Context, Result};
use std::time::Duration;

/// Where the polling loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// The run is researching or done; its result can be awaited.
    AwaitResult,
    /// The user typed an exit word and the run was told to end.
    EndedByUser,
    /// Input closed while an answer was expected. The run was left untouched.
    InputClosed,
    /// The run reported a failed terminal status.
    RunTerminal(ResearchStatus),
    /// A call failed and the engine reports the run is no longer running.
    EngineStopped(ExecutionStatus),
}

#[derive(Debug)]
enum Step {
    Poll,
    Answer(StatusSnapshot),
    Recover(EngineError),
    Wait(Duration),
    Exit(LoopExit),
}

pub(crate) struct SessionDriver<'a, H: ?Sized> {
    handle: &'a H,
    console: &'a mut dyn Console,
    cfg: DriverConfig,
}

impl<'a, H: RunHandle + ?Sized> SessionDriver<'a, H> {
    pub fn new(handle: &'a H, console: &'a mut dyn Console, cfg: DriverConfig) -> Self {
        Self {
            handle,
            console,
            cfg,
        }
    }

    /// Polls the run and answers its clarification questions until there is nothing
    /// left for the client to do.
    pub async fn interactive_loop(&mut self) -> Result<LoopExit> {
        let mut step = Step::Poll;
        loop {
            step = match step {
                Step::Exit(exit) => {
                    tracing::debug!(run_id = self.handle.run_id(), ?exit, "interactive loop done");
                    return Ok(exit);
                }
                Step::Poll => self.poll().await,
                Step::Answer(snapshot) => self.answer(snapshot).await?,
                Step::Recover(err) => self.recover(err).await?,
                Step::Wait(delay) => {
                    tokio::time::sleep(delay).await;
                    Step::Poll
                }
            };
        }
    }

    async fn poll(&mut self) -> Step {
        match self.handle.query_status().await {
            Ok(Some(snapshot)) => self.react(snapshot),
            Ok(None) => Step::Wait(self.cfg.poll_interval),
            Err(e) => Step::Recover(e),
        }
    }

    /// Chooses the next step for a freshly polled snapshot.
    fn react(&mut self, snapshot: StatusSnapshot) -> Step {
        match snapshot.status.clone() {
            ResearchStatus::Pending => {
                self.console.say("Starting research...");
                Step::Wait(self.cfg.retry_delay)
            }
            ResearchStatus::AwaitingClarifications | ResearchStatus::CollectingAnswers => {
                if snapshot.current_question().is_none() {
                    // Answers are in but the run has not moved on yet.
                    return Step::Wait(self.cfg.poll_interval);
                }
                self.console.say("");
                self.console.say(
                    "I need to ask you some clarifying questions to provide better research.",
                );
                self.console.say(&"-".repeat(60));
                Step::Answer(snapshot)
            }
            ResearchStatus::Researching => {
                for line in research_progress_lines() {
                    self.console.say(&line);
                }
                Step::Exit(LoopExit::AwaitResult)
            }
            ResearchStatus::Completed => Step::Exit(LoopExit::AwaitResult),
            status @ (ResearchStatus::Failed
            | ResearchStatus::TimedOut
            | ResearchStatus::Terminated
            | ResearchStatus::Canceled) => {
                self.console
                    .warn(&format!("Research run ended with status: {status}"));
                Step::Exit(LoopExit::RunTerminal(status))
            }
            ResearchStatus::Unknown(raw) => {
                tracing::warn!(run_id = self.handle.run_id(), status = %raw, "unrecognized run status");
                self.console
                    .say(&format!("Unexpected status: {raw}, waiting..."));
                Step::Wait(self.cfg.retry_delay)
            }
        }
    }

    /// Asks the current question and submits the answer; the update's snapshot
    /// decides what comes next.
    async fn answer(&mut self, snapshot: StatusSnapshot) -> Result<Step> {
        let (Some(question), Some(index)) =
            (snapshot.current_question(), snapshot.current_question_index)
        else {
            // Round finished; see what the run does next.
            return Ok(Step::Poll);
        };

        self.console.say(&format!(
            "Question {} of {}",
            index + 1,
            snapshot.question_count()
        ));
        self.console.say(question);

        let Some(raw) = self.console.ask("Your answer: ").await? else {
            self.console.warn("Input closed, leaving the research session open.");
            return Ok(Step::Exit(LoopExit::InputClosed));
        };

        if is_exit_word(&raw) {
            self.console.say("Ending research session...");
            self.handle
                .signal_end()
                .await
                .with_context(|| format!("failed to end workflow {}", self.handle.run_id()))?;
            return Ok(Step::Exit(LoopExit::EndedByUser));
        }

        let answer = ClarificationAnswer::from_input(index, &raw);
        match self
            .handle
            .update(RunUpdate::SingleClarification(answer))
            .await
        {
            Ok(next) => Ok(Step::Answer(next)),
            Err(e) => Ok(Step::Recover(e)),
        }
    }

    /// A query or update failed: keep going only while the engine still runs the run.
    async fn recover(&mut self, err: EngineError) -> Result<Step> {
        tracing::warn!(run_id = self.handle.run_id(), error = %err, "interaction failed");
        self.console
            .warn(&format!("Error during interaction: {err}"));

        let exec = self.handle.describe().await.with_context(|| {
            format!(
                "workflow {} could not be described after: {err}",
                self.handle.run_id()
            )
        })?;
        if exec.is_running() {
            return Ok(Step::Wait(self.cfg.retry_delay));
        }
        self.console
            .warn(&format!("Workflow has terminated with status: {exec}"));
        Ok(Step::Exit(LoopExit::EngineStopped(exec)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::ScriptedConsole;
    use crate::engine::fake::{Call, FakeEngine, FakeRun};
    use crate::engine::WorkflowEngine;
    use crate::model::NO_PREFERENCE;
    use pretty_assertions::assert_eq;

    fn interactive_run(questions: &[&str], index: usize) -> FakeRun {
        let mut run = FakeRun::with_status(ResearchStatus::AwaitingClarifications);
        if let Some(s) = run.snapshot.as_mut() {
            s.clarification_questions = Some(questions.iter().map(|q| q.to_string()).collect());
            s.current_question_index = Some(index);
        }
        run
    }

    async fn drive(engine: &FakeEngine, console: &mut ScriptedConsole) -> Result<LoopExit> {
        let handle = engine.get_handle("wf").await?;
        SessionDriver::new(&handle, console, DriverConfig::default())
            .interactive_loop()
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn answers_each_question_then_awaits_result() {
        let engine = FakeEngine::with_questions(&["Budget?", "Dates?"]);
        engine.insert_run("wf", interactive_run(&["Budget?", "Dates?"], 0));
        let mut console = ScriptedConsole::with_answers(&["1000", ""]);

        let exit = drive(&engine, &mut console).await.unwrap();
        assert_eq!(exit, LoopExit::AwaitResult);

        let answers: Vec<_> = engine
            .updates()
            .into_iter()
            .map(|u| match u {
                RunUpdate::SingleClarification(a) => (a.question_index, a.answer),
                other => panic!("unexpected update {other:?}"),
            })
            .collect();
        assert_eq!(
            answers,
            vec![(0, "1000".to_string()), (1, NO_PREFERENCE.to_string())]
        );
        assert!(console.saw("Question 1 of 2"));
        assert!(console.saw("Question 2 of 2"));
        assert!(console.saw("Dates?"));

        let snap = engine.run("wf").unwrap().snapshot.unwrap();
        assert_eq!(snap.current_question_index, Some(2));
        assert_eq!(snap.current_question(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn update_snapshot_replaces_working_copy_without_extra_query() {
        let engine = FakeEngine::with_questions(&["Budget?", "Dates?"]);
        engine.insert_run("wf", interactive_run(&["Budget?", "Dates?"], 0));
        let mut console = ScriptedConsole::with_answers(&["1000", "June"]);

        drive(&engine, &mut console).await.unwrap();

        let kinds: Vec<&str> = engine
            .calls()
            .iter()
            .map(|c| match c {
                Call::Query(_) => "query",
                Call::Update(..) => "update",
                Call::GetHandle(_) => "handle",
                _ => "other",
            })
            .collect();
        // One poll, two updates back to back, one poll observing `researching`.
        assert_eq!(kinds, vec!["handle", "query", "update", "update", "query"]);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_word_signals_and_stops_immediately() {
        let engine = FakeEngine::with_questions(&["Budget?"]);
        engine.insert_run("wf", interactive_run(&["Budget?"], 0));
        let mut console = ScriptedConsole::with_answers(&[" Quit "]);

        let exit = drive(&engine, &mut console).await.unwrap();
        assert_eq!(exit, LoopExit::EndedByUser);

        let calls = engine.calls();
        assert_eq!(calls.last(), Some(&Call::Signal("wf".into())));
        assert!(engine.updates().is_empty());
        assert_eq!(
            calls.iter().filter(|c| matches!(c, Call::Query(_))).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn researching_skips_clarifications() {
        let engine = FakeEngine::with_questions(&[]);
        engine.insert_run("wf", FakeRun::with_status(ResearchStatus::Researching));
        let mut console = ScriptedConsole::default();

        let exit = drive(&engine, &mut console).await.unwrap();
        assert_eq!(exit, LoopExit::AwaitResult);
        assert_eq!(console.prompts, 0);
        assert!(engine.updates().is_empty());
        assert!(console.saw("Research in progress"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_status_is_terminal_without_result() {
        let engine = FakeEngine::with_questions(&[]);
        engine.insert_run("wf", FakeRun::with_status(ResearchStatus::TimedOut));
        let mut console = ScriptedConsole::default();

        let exit = drive(&engine, &mut console).await.unwrap();
        assert_eq!(exit, LoopExit::RunTerminal(ResearchStatus::TimedOut));
        assert!(!engine.calls().iter().any(|c| matches!(c, Call::Result(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_and_unknown_statuses_are_repolled() {
        let engine = FakeEngine::with_questions(&[]);
        let mut run = FakeRun::with_status(ResearchStatus::Completed);
        run.scripted.push_back(StatusSnapshot::new(ResearchStatus::Pending));
        run.scripted
            .push_back(StatusSnapshot::new(ResearchStatus::Unknown("paused".into())));
        engine.insert_run("wf", run);
        let mut console = ScriptedConsole::default();

        let exit = drive(&engine, &mut console).await.unwrap();
        assert_eq!(exit, LoopExit::AwaitResult);
        assert!(console.saw("Unexpected status: paused"));
        assert_eq!(
            engine
                .calls()
                .iter()
                .filter(|c| matches!(c, Call::Query(_)))
                .count(),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_query_failure_retries_while_running() {
        let engine = FakeEngine::with_questions(&[]);
        let mut run = FakeRun::with_status(ResearchStatus::Researching);
        run.failing_queries = 2;
        engine.insert_run("wf", run);
        let mut console = ScriptedConsole::default();

        let exit = drive(&engine, &mut console).await.unwrap();
        assert_eq!(exit, LoopExit::AwaitResult);
        let describes = engine
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Describe(_)))
            .count();
        assert_eq!(describes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn query_failure_on_stopped_run_exits() {
        let engine = FakeEngine::with_questions(&[]);
        let mut run = FakeRun::with_status(ResearchStatus::Researching);
        run.failing_queries = 1;
        run.execution = ExecutionStatus::Terminated;
        engine.insert_run("wf", run);
        let mut console = ScriptedConsole::default();

        let exit = drive(&engine, &mut console).await.unwrap();
        assert_eq!(exit, LoopExit::EngineStopped(ExecutionStatus::Terminated));
        assert!(console.saw("Workflow has terminated with status: TERMINATED"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_answer_recovers_and_repolls() {
        let engine = FakeEngine::with_questions(&["Budget?"]);
        // The run already moved on, so the single-answer update is rejected.
        let mut run = interactive_run(&["Budget?"], 0);
        run.scripted.push_back(run.snapshot.clone().unwrap());
        if let Some(s) = run.snapshot.as_mut() {
            s.status = ResearchStatus::Researching;
        }
        engine.insert_run("wf", run);
        let mut console = ScriptedConsole::with_answers(&["1000"]);

        let exit = drive(&engine, &mut console).await.unwrap();
        assert_eq!(exit, LoopExit::AwaitResult);
        assert!(console.saw("Error during interaction"));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_input_leaves_run_open() {
        let engine = FakeEngine::with_questions(&["Budget?"]);
        engine.insert_run("wf", interactive_run(&["Budget?"], 0));
        let mut console = ScriptedConsole::default();

        let exit = drive(&engine, &mut console).await.unwrap();
        assert_eq!(exit, LoopExit::InputClosed);
        assert!(!engine.calls().iter().any(|c| matches!(c, Call::Signal(_))));
    }
}
