//! Console input: a rustyline editor feeding lines to the dispatcher.

use anyhow::{anyhow, Context as _, Result};
use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{Context, Editor, Helper};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use super::PROMPT;
use crate::commands::{CommandCaller, CommandDispatcher};
use crate::host::Host;

/// Tab completion of command names.
///
/// Only the first word is completed, and only when the prefix matches no
/// more than the prediction threshold.
pub struct CommandCompleter {
    commands: Arc<CommandDispatcher>,
}

impl CommandCompleter {
    pub fn new(commands: Arc<CommandDispatcher>) -> Self {
        Self { commands }
    }

    /// Candidate commands for the text before the cursor.
    #[must_use]
    pub fn candidates(&self, head: &str) -> Vec<String> {
        if head.contains(char::is_whitespace) {
            return Vec::new();
        }

        let mut commands: Vec<String> = self
            .commands
            .get_prediction(head, false)
            .entries
            .iter()
            .map(|entry| entry.command().to_string())
            .collect();
        commands.sort();
        commands
    }
}

impl Completer for CommandCompleter {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let head = line.get(..pos).unwrap_or(line);
        let pairs = self
            .candidates(head)
            .into_iter()
            .map(|command| Pair {
                display: command.clone(),
                replacement: command,
            })
            .collect();
        Ok((0, pairs))
    }
}

impl Hinter for CommandCompleter {
    type Hint = String;
}

impl Highlighter for CommandCompleter {}

impl Validator for CommandCompleter {}

impl Helper for CommandCompleter {}

pub struct ConsoleReader;

impl ConsoleReader {
    /// Start reading console input on a dedicated thread.
    ///
    /// Every line is dispatched as a console command. End of input or an
    /// interrupt stops the host.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned or the line editor
    /// cannot be attached to the terminal.
    pub fn spawn(host: &Arc<Host>) -> Result<JoinHandle<()>> {
        let commands = Arc::clone(host.commands());
        let host = Arc::downgrade(host);
        let (ready, attached) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("console-input".to_string())
            .spawn(move || {
                let editor = match Editor::<CommandCompleter, DefaultHistory>::new() {
                    Ok(mut editor) => {
                        editor.set_helper(Some(CommandCompleter::new(commands)));
                        let _ = ready.send(Ok(()));
                        editor
                    }
                    Err(e) => {
                        let _ = ready.send(Err(e.to_string()));
                        return;
                    }
                };
                read_lines(editor, &host);
            })
            .context("Failed to spawn console input thread")?;

        match attached.recv() {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(message)) => Err(anyhow!(message)).context("Failed to attach console input"),
            Err(_) => Err(anyhow!("Console input thread exited during startup")),
        }
    }
}

fn read_lines(mut editor: Editor<CommandCompleter, DefaultHistory>, host: &Weak<Host>) {
    loop {
        let input = editor.readline(PROMPT);
        let Some(host) = host.upgrade() else {
            break;
        };

        match input {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = editor.add_history_entry(line) {
                    debug!("Failed to record history: {e}");
                }
                host.execute_command(&CommandCaller::Console, line);
                if !host.is_running() {
                    break;
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => {
                info!("Console input closed");
                host.stop();
                break;
            }
            Err(e) => {
                error!("Console input failed: {e}");
                host.stop();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::executor;

    #[test]
    fn test_candidates_follow_prediction_threshold() {
        let commands = Arc::new(CommandDispatcher::new());
        for command in ["stop", "status", "say"] {
            commands.register_command(command, None, executor(|_, _, _| {}));
        }
        for i in 0..12 {
            commands.register_command(&format!("warp{i}"), None, executor(|_, _, _| {}));
        }
        let completer = CommandCompleter::new(commands);

        assert_eq!(completer.candidates("st"), vec!["status", "stop"]);
        assert_eq!(completer.candidates("S").len(), 3);
        assert!(completer.candidates("warp").is_empty());
        assert!(completer.candidates("stop now").is_empty());
        assert!(completer.candidates("zzz").is_empty());
    }
}
