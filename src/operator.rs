//! Operator interaction
//!
//! Procedures stop to ask the operator to rewire the bench, confirm a
//! choice, or read a label. [`ConsoleOperator`] does this on the terminal;
//! [`ScriptedOperator`] answers from a script and keeps a transcript, for
//! simulated runs and tests.

use crate::error::{AppResult, CalError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

#[async_trait]
pub trait Operator: Send {
    /// Show an instruction and wait for acknowledgement.
    async fn prompt(&mut self, message: &str) -> AppResult<()>;

    async fn confirm(&mut self, question: &str) -> AppResult<bool>;

    /// Free text answer; `None` if left blank.
    async fn ask_text(&mut self, prompt: &str) -> AppResult<Option<String>>;

    /// Pick a subset of `available` test names.
    async fn select_tests(&mut self, available: &[String]) -> AppResult<Vec<String>>;

    fn progress(&mut self, done: usize, total: usize, label: &str) {
        info!("[{}/{}] {}", done, total, label);
    }
}

/// Terminal operator. Input is read on a blocking thread.
#[derive(Debug, Default)]
pub struct ConsoleOperator;

impl ConsoleOperator {
    pub fn new() -> Self {
        Self
    }

    async fn read_line(prompt: String) -> AppResult<String> {
        tokio::task::spawn_blocking(move || -> AppResult<String> {
            let mut stdout = io::stdout();
            write!(stdout, "{} ", prompt)?;
            stdout.flush()?;
            let mut line = String::new();
            if io::stdin().lock().read_line(&mut line)? == 0 {
                return Err(CalError::Aborted);
            }
            Ok(line.trim().to_string())
        })
        .await
        .map_err(|e| CalError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }
}

#[async_trait]
impl Operator for ConsoleOperator {
    async fn prompt(&mut self, message: &str) -> AppResult<()> {
        let answer = Self::read_line(format!("{}\n  [Enter to continue, q to abort]", message)).await?;
        if answer.eq_ignore_ascii_case("q") {
            return Err(CalError::Aborted);
        }
        Ok(())
    }

    async fn confirm(&mut self, question: &str) -> AppResult<bool> {
        let answer = Self::read_line(format!("{} [y/N]", question)).await?;
        Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
    }

    async fn ask_text(&mut self, prompt: &str) -> AppResult<Option<String>> {
        let answer = Self::read_line(prompt.to_string()).await?;
        Ok((!answer.is_empty()).then_some(answer))
    }

    async fn select_tests(&mut self, available: &[String]) -> AppResult<Vec<String>> {
        let mut listing = String::from("Tests found in the workbook:\n");
        for (i, name) in available.iter().enumerate() {
            listing.push_str(&format!("  {:>2}) {}\n", i + 1, name));
        }
        listing.push_str("Select tests (numbers or names, comma separated, blank for all):");
        let answer = Self::read_line(listing).await?;
        Ok(parse_selection(&answer, available))
    }

    fn progress(&mut self, done: usize, total: usize, label: &str) {
        info!("[{}/{}] {}", done, total, label);
        println!("  {:>3}% {}", done * 100 / total.max(1), label);
    }
}

/// Interpret a selection answer against `available`.
///
/// Blank or `all` selects everything; otherwise each comma-separated token is
/// a 1-based index or a name. Unknown tokens are ignored.
pub fn parse_selection(answer: &str, available: &[String]) -> Vec<String> {
    let answer = answer.trim();
    if answer.is_empty() || answer.eq_ignore_ascii_case("all") {
        return available.to_vec();
    }
    let mut selected: Vec<String> = Vec::new();
    for token in answer.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let pick = match token.parse::<usize>() {
            Ok(index) => index.checked_sub(1).and_then(|i| available.get(i)),
            Err(_) => available.iter().find(|name| name.eq_ignore_ascii_case(token)),
        };
        if let Some(name) = pick {
            if !selected.contains(name) {
                selected.push(name.clone());
            }
        }
    }
    selected
}

#[derive(Debug, Default)]
struct Script {
    confirm: bool,
    texts: VecDeque<String>,
    selection: Option<Vec<String>>,
    transcript: Vec<String>,
    progress: Vec<(usize, usize)>,
}

/// Operator that answers from a script. Clones share the script and
/// transcript.
#[derive(Debug, Clone, Default)]
pub struct ScriptedOperator {
    script: Arc<Mutex<Script>>,
}

impl ScriptedOperator {
    /// Acknowledges every prompt, answers no to every question, and selects
    /// every test.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirming(self, answer: bool) -> Self {
        self.script().confirm = answer;
        self
    }

    /// Queue an answer for the next [`Operator::ask_text`].
    pub fn with_text(self, answer: impl Into<String>) -> Self {
        self.script().texts.push_back(answer.into());
        self
    }

    pub fn selecting(self, tests: &[&str]) -> Self {
        self.script().selection = Some(tests.iter().map(|t| t.to_string()).collect());
        self
    }

    /// Every prompt, question and text request seen so far.
    pub fn transcript(&self) -> Vec<String> {
        self.script().transcript.clone()
    }

    /// `(done, total)` for every progress report.
    pub fn progress_reports(&self) -> Vec<(usize, usize)> {
        self.script().progress.clone()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Operator for ScriptedOperator {
    async fn prompt(&mut self, message: &str) -> AppResult<()> {
        info!("Operator: {}", message);
        self.script().transcript.push(message.to_string());
        Ok(())
    }

    async fn confirm(&mut self, question: &str) -> AppResult<bool> {
        let mut script = self.script();
        script.transcript.push(question.to_string());
        Ok(script.confirm)
    }

    async fn ask_text(&mut self, prompt: &str) -> AppResult<Option<String>> {
        let mut script = self.script();
        script.transcript.push(prompt.to_string());
        Ok(script.texts.pop_front())
    }

    async fn select_tests(&mut self, available: &[String]) -> AppResult<Vec<String>> {
        let script = self.script();
        Ok(match &script.selection {
            Some(wanted) => available
                .iter()
                .filter(|name| wanted.iter().any(|w| w.eq_ignore_ascii_case(name)))
                .cloned()
                .collect(),
            None => available.to_vec(),
        })
    }

    fn progress(&mut self, done: usize, total: usize, label: &str) {
        info!("[{}/{}] {}", done, total, label);
        self.script().progress.push((done, total));
    }
}
