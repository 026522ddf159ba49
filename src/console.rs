//! Terminal I/O used by the session driver.
//!
//! Output goes through a dedicated blocking writer so async tasks never block on
//! stdout; answers are read line by line from stdin.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;

#[async_trait]
pub trait Console: Send {
    /// Prints one line for the user.
    fn say(&mut self, line: &str);

    /// Prints one line on the error stream.
    fn warn(&mut self, line: &str);

    /// Shows `prompt` and reads one line. `None` means input is closed.
    async fn ask(&mut self, prompt: &str) -> Result<Option<String>>;
}

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
    /// Written without a newline and flushed immediately.
    Prompt(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
                OutputLine::Prompt(msg) => {
                    let _ = write!(out, "{}", msg);
                    let _ = out.flush();
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

/// Console backed by the process's stdin/stdout.
pub struct StdConsole {
    tx: mpsc::UnboundedSender<OutputLine>,
    writer: tokio::task::JoinHandle<()>,
    input: Lines<BufReader<Stdin>>,
}

impl StdConsole {
    pub fn new() -> Self {
        let (tx, writer) = spawn_output_writer();
        Self {
            tx,
            writer,
            input: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Drains pending output before the process exits.
    pub async fn finish(self) {
        drop(self.tx);
        let _ = self.writer.await;
    }
}

#[async_trait]
impl Console for StdConsole {
    fn say(&mut self, line: &str) {
        let _ = self.tx.send(OutputLine::Stdout(line.to_string()));
    }

    fn warn(&mut self, line: &str) {
        let _ = self.tx.send(OutputLine::Stderr(line.to_string()));
    }

    async fn ask(&mut self, prompt: &str) -> Result<Option<String>> {
        let _ = self.tx.send(OutputLine::Prompt(prompt.to_string()));
        self.input
            .next_line()
            .await
            .context("failed to read from stdin")
    }
}

/// Console fed from a fixed list of answers, recording everything shown.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct ScriptedConsole {
    pub answers: std::collections::VecDeque<String>,
    pub transcript: Vec<String>,
    pub prompts: usize,
}

#[cfg(test)]
impl ScriptedConsole {
    pub fn with_answers(answers: &[&str]) -> Self {
        Self {
            answers: answers.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn saw(&self, needle: &str) -> bool {
        self.transcript.iter().any(|l| l.contains(needle))
    }
}

#[cfg(test)]
#[async_trait]
impl Console for ScriptedConsole {
    fn say(&mut self, line: &str) {
        self.transcript.push(line.to_string());
    }

    fn warn(&mut self, line: &str) {
        self.transcript.push(line.to_string());
    }

    async fn ask(&mut self, prompt: &str) -> Result<Option<String>> {
        self.prompts += 1;
        self.transcript.push(prompt.to_string());
        Ok(self.answers.pop_front())
    }
}
