use anyhow::{Context, Result};
use futures::StreamExt;
use std::io::{self, BufRead, Write};
use tracing::{debug, warn};

use crate::model::ConversationHistory;
use crate::model_gateway::ChatGateway;
use crate::transport::clean::{clean_content, default_cleaner};

const WELCOME: &str =
    "Welcome to the interactive shell. Type 'help' for available commands or 'exit' to quit.";
const HELP: &str = "Available commands:
  help    - Show this help message
  clear   - Clear the conversation history
  exit    - Exit the interactive shell";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShellCommand {
    Exit,
    Help,
    Clear,
}

impl ShellCommand {
    fn parse(input: &str) -> Option<Self> {
        if input.eq_ignore_ascii_case("exit") {
            Some(Self::Exit)
        } else if input.eq_ignore_ascii_case("help") {
            Some(Self::Help)
        } else if input.eq_ignore_ascii_case("clear") {
            Some(Self::Clear)
        } else {
            None
        }
    }
}

/// Interactive conversation: owns the history and drives one streamed chat
/// call per user line.
pub struct ConversationSession<'a, G: ?Sized> {
    gateway: &'a G,
    history: ConversationHistory,
}

impl<'a, G> ConversationSession<'a, G>
where
    G: ChatGateway + ?Sized,
{
    pub fn new(gateway: &'a G, system_prompt: impl Into<String>) -> Self {
        Self {
            gateway,
            history: ConversationHistory::new(system_prompt),
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Reads lines from `input` until `exit` or end of input.
    pub async fn run<R, W>(&mut self, mut input: R, output: &mut W) -> Result<()>
    where
        R: BufRead,
        W: Write,
    {
        writeln!(output, "{WELCOME}").context("Failed to write banner")?;

        loop {
            write!(output, "You: ").context("Failed to write prompt")?;
            output.flush().context("Failed to flush output")?;

            let mut line = String::new();
            let read = input
                .read_line(&mut line)
                .context("Failed to read input")?;
            if read == 0 {
                writeln!(output).context("Failed to write output")?;
                writeln!(output, "Exiting interactive shell.").context("Failed to write output")?;
                break;
            }

            let line = line.trim();
            match ShellCommand::parse(line) {
                Some(ShellCommand::Exit) => {
                    writeln!(output, "Exiting interactive shell.")
                        .context("Failed to write output")?;
                    break;
                }
                Some(ShellCommand::Help) => {
                    writeln!(output, "{HELP}").context("Failed to write output")?;
                }
                Some(ShellCommand::Clear) => {
                    self.history.clear();
                    writeln!(output, "Conversation history cleared.")
                        .context("Failed to write output")?;
                }
                None if line.is_empty() => {}
                None => self.chat_turn(line, output).await?,
            }
        }

        Ok(())
    }

    /// One user turn. Transport failures are printed and the user message is
    /// rolled back; only output errors propagate.
    async fn chat_turn<W: Write>(&mut self, prompt: &str, output: &mut W) -> Result<()> {
        let checkpoint = self.history.len();
        self.history.push_user(prompt);
        debug!(history_len = self.history.len(), "starting chat turn");

        let mut stream = match self.gateway.stream_chat(self.history.messages()).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "chat request failed");
                self.history.rollback_to(checkpoint);
                writeln!(output, "An error occurred: {err}").context("Failed to write output")?;
                return Ok(());
            }
        };

        write!(output, "AI: ").context("Failed to write output")?;
        output.flush().context("Failed to flush output")?;

        let mut visible = default_cleaner().stream();
        let mut reply = String::new();
        let mut failure = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    let delta = chunk.delta_content();
                    if delta.is_empty() {
                        continue;
                    }
                    write!(output, "{}", visible.push(&delta)).context("Failed to write output")?;
                    output.flush().context("Failed to flush output")?;
                    reply.push_str(&delta);
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        writeln!(output, "{}", visible.finish()).context("Failed to write output")?;

        if let Some(err) = failure {
            warn!(error = %err, "chat stream failed");
            self.history.rollback_to(checkpoint);
            writeln!(output, "An error occurred: {err}").context("Failed to write output")?;
            return Ok(());
        }

        self.history.push_assistant(clean_content(&reply));
        debug!(
            history_len = self.history.len(),
            reply_len = reply.len(),
            "chat turn complete"
        );
        Ok(())
    }
}

/// Runs the shell on stdin/stdout.
pub async fn run_repl<G>(gateway: &G, system_prompt: &str) -> Result<()>
where
    G: ChatGateway + ?Sized,
{
    let mut session = ConversationSession::new(gateway, system_prompt);
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    session.run(stdin.lock(), &mut stdout).await
}
