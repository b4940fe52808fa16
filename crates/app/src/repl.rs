use confab_chat::{ChatState, ConversationId, ConversationManager, Role, SendOutcome};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};

use crate::settings::SettingsStore;

const HELP: &str = "\
commands:
  /new            start a new conversation
  /list           list conversations, newest first
  /select <n|id>  switch to a conversation by list number or id
  /model <name>   save the model used from the next launch
  /help           show this help
  /quit           exit
anything else is sent as a message";

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    New,
    List,
    Select(String),
    Model(String),
    Help,
    Quit,
    Say(String),
    Unknown(String),
}

impl Command {
    /// Parses a line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let Some(rest) = line.strip_prefix('/') else {
            return Some(Self::Say(line.to_string()));
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };
        let command = match (name, argument.is_empty()) {
            ("new", true) => Self::New,
            ("list", true) => Self::List,
            ("help", true) => Self::Help,
            ("quit" | "exit", true) => Self::Quit,
            ("select", false) => Self::Select(argument.to_string()),
            ("model", false) => Self::Model(argument.to_string()),
            _ => Self::Unknown(line.to_string()),
        };
        Some(command)
    }
}

/// Resolves `/select` input: a 1-based sidebar position or a raw id.
pub fn resolve_selection(state: &ChatState, target: &str) -> ConversationId {
    let entries = state.sidebar_entries();
    target
        .parse::<usize>()
        .ok()
        .and_then(|position| position.checked_sub(1))
        .and_then(|index| entries.get(index))
        .map(|entry| entry.id.clone())
        .unwrap_or_else(|| ConversationId::new(target))
}

/// Sidebar listing, newest first, active conversation marked with `*`.
pub fn render_sidebar(state: &ChatState) -> String {
    state
        .sidebar_entries()
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let marker = if entry.is_active { '*' } else { ' ' };
            format!("{marker} {:>2}. {} ({})\n", index + 1, entry.title, entry.id)
        })
        .collect()
}

/// Printed once while a reply is loading, ahead of its first text.
pub const PENDING_MARKER: &str = "... ";

/// Turns successive snapshots of one send into terminal output.
///
/// Prints only the new tail of the streaming reply. A reply that stops
/// extending the printed text (the failure notice) is printed on a fresh line.
#[derive(Debug, Default)]
pub struct ReplyPrinter {
    printed: String,
    marked: bool,
    finished: bool,
}

impl ReplyPrinter {
    pub fn update(&mut self, state: &ChatState) -> Option<String> {
        if self.finished {
            return None;
        }

        let reply = state
            .active_conversation()?
            .last_message()
            .filter(|message| message.role == Role::Model)?;

        let mut output = String::new();
        if !self.marked && state.shows_loading_indicator() {
            self.marked = true;
            output.push_str(PENDING_MARKER);
        }
        match reply.text.strip_prefix(self.printed.as_str()) {
            Some(suffix) => output.push_str(suffix),
            None => {
                output.push('\n');
                output.push_str(&reply.text);
            }
        }
        self.printed.clone_from(&reply.text);

        if !state.is_loading {
            self.finished = true;
            output.push('\n');
        }
        (!output.is_empty()).then_some(output)
    }
}

#[derive(Debug, Snafu)]
pub enum ReplError {
    #[snafu(display("failed to read terminal input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write terminal output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub struct Repl {
    manager: ConversationManager,
    settings: SettingsStore,
    stdout: Stdout,
}

impl Repl {
    pub fn new(manager: ConversationManager, settings: SettingsStore) -> Self {
        Self {
            manager,
            settings,
            stdout: tokio::io::stdout(),
        }
    }

    pub async fn run(mut self) -> Result<(), ReplError> {
        self.manager.ensure_conversation();
        self.write("type a message, or /help for commands\n").await?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            self.write("> ").await?;
            let Some(line) = lines.next_line().await.context(ReadInputSnafu {
                stage: "read-input-line",
            })?
            else {
                break;
            };

            let Some(command) = Command::parse(&line) else {
                continue;
            };
            if command == Command::Quit {
                break;
            }
            self.handle(command).await?;
        }

        tracing::debug!(
            conversations = self.manager.state().conversations.len(),
            sessions = self.manager.sessions().len(),
            "leaving chat loop"
        );
        Ok(())
    }

    async fn handle(&mut self, command: Command) -> Result<(), ReplError> {
        match command {
            Command::New => {
                let id = self.manager.start_new_conversation();
                self.write(&format!("started {id}\n")).await
            }
            Command::List => {
                let listing = render_sidebar(self.manager.state());
                self.write(&listing).await
            }
            Command::Select(target) => {
                let id = resolve_selection(self.manager.state(), &target);
                self.manager.select_conversation(id);
                let notice = match self.manager.state().active_conversation() {
                    Some(conversation) => format!(
                        "now in \"{}\" ({} messages)\n",
                        conversation.display_title(),
                        conversation.messages.len()
                    ),
                    None => format!("no conversation matches '{target}', see /list\n"),
                };
                self.write(&notice).await
            }
            Command::Model(model) => {
                let notice = match self.settings.set_model(&model) {
                    Ok(()) => format!(
                        "saved model '{model}' to {:?}, used from the next launch\n",
                        self.settings.config_path()
                    ),
                    Err(error) => {
                        tracing::error!(%error, "failed to save model setting");
                        format!("could not save settings: {error}\n")
                    }
                };
                self.write(&notice).await
            }
            Command::Help => self.write(&format!("{HELP}\n")).await,
            Command::Unknown(line) => {
                self.write(&format!("unknown command '{line}', try /help\n"))
                    .await
            }
            Command::Say(text) => self.say(text).await,
            Command::Quit => Ok(()),
        }
    }

    async fn say(&mut self, text: String) -> Result<(), ReplError> {
        self.manager.set_user_input(text);
        if !self.manager.state().can_submit() {
            return self
                .write("nothing to send here, start a conversation with /new\n")
                .await;
        }

        let mut snapshots = self.manager.subscribe();
        let mut printer = ReplyPrinter::default();

        let outcome = {
            let send = self.manager.submit_input();
            tokio::pin!(send);
            loop {
                tokio::select! {
                    outcome = &mut send => break outcome,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            continue;
                        }
                        let snapshot = snapshots.borrow_and_update().clone();
                        if let Some(output) = printer.update(&snapshot) {
                            write_to(&mut self.stdout, &output).await?;
                        }
                    }
                }
            }
        };

        if outcome != SendOutcome::Ignored {
            if let Some(output) = printer.update(self.manager.state()) {
                self.write(&output).await?;
            }
        }
        Ok(())
    }

    async fn write(&mut self, text: &str) -> Result<(), ReplError> {
        write_to(&mut self.stdout, text).await
    }
}

async fn write_to(stdout: &mut Stdout, text: &str) -> Result<(), ReplError> {
    stdout
        .write_all(text.as_bytes())
        .await
        .context(WriteOutputSnafu {
            stage: "write-output",
        })?;
    stdout.flush().await.context(WriteOutputSnafu {
        stage: "flush-output",
    })
}
