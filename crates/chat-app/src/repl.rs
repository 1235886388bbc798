//! Line-oriented terminal front end.
//!
//! The open thread is rendered from two live sources: the repository's
//! message subscription and the coordinator's session snapshot. Both feed one
//! renderer task so committed replies that were already streamed are not
//! printed twice.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use quill_conversation::{
    ChatError, MAX_PROMPT_CHARS, SessionSnapshot, SessionState, StreamCoordinator,
    exceeds_prompt_budget, filter_threads, prompt_char_count, tidy_prompt,
};
use quill_llm::StreamTarget;
use quill_storage::{LiveQuery, MessageRecord, MessageRole, ThreadId, ThreadRecord};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::settings::{SettingsError, SettingsStore};

pub const HELP_TEXT: &str = "\
commands:
  /new [title]        create a thread and open it
  /list [filter]      list threads, most recent first
  /open <n|id>        open a thread by list number or id prefix
  /delete <n|id>      delete a thread and its messages
  /stop               stop the reply being streamed
  /tidy <text>        tidy the prompt, then send it
  /model [name]       show or change the model
  /thoughts           toggle reasoning output
  /help               show this help
  /quit               exit
anything else is sent to the open thread";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    New(String),
    List(String),
    Open(String),
    Delete(String),
    Stop,
    Tidy(String),
    Model(Option<String>),
    Thoughts,
    Help,
    Quit,
    Say(String),
    Empty,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommandError {
    #[snafu(display("unknown command `/{name}`, try /help"))]
    UnknownCommand { stage: &'static str, name: String },
    #[snafu(display("`/{command}` needs an argument"))]
    MissingArgument {
        stage: &'static str,
        command: &'static str,
    },
}

pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Say(line.to_string()));
    };

    let (name, argument) = match rest.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (rest, ""),
    };

    let required = |command: &'static str| {
        if argument.is_empty() {
            MissingArgumentSnafu {
                stage: "parse-command",
                command,
            }
            .fail()
        } else {
            Ok(argument.to_string())
        }
    };

    let command = match name {
        "new" => Command::New(argument.to_string()),
        "list" | "ls" => Command::List(argument.to_string()),
        "open" => Command::Open(required("open")?),
        "delete" | "rm" => Command::Delete(required("delete")?),
        "stop" => Command::Stop,
        "tidy" => Command::Tidy(required("tidy")?),
        "model" => Command::Model((!argument.is_empty()).then(|| argument.to_string())),
        "thoughts" => Command::Thoughts,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => {
            return UnknownCommandSnafu {
                stage: "parse-command",
                name: name.to_string(),
            }
            .fail();
        }
    };
    Ok(command)
}

/// Resolves a 1-based index into the last listing, or a unique id prefix.
pub fn resolve_thread<'a>(
    listed: &'a [ThreadRecord],
    all: &'a [ThreadRecord],
    argument: &str,
) -> Option<&'a ThreadRecord> {
    let argument = argument.trim();
    if let Ok(index) = argument.parse::<usize>()
        && let Some(thread) = index.checked_sub(1).and_then(|index| listed.get(index))
    {
        return Some(thread);
    }

    let prefix = argument.to_lowercase();
    if prefix.is_empty() {
        return None;
    }
    let mut matches = all
        .iter()
        .filter(|thread| thread.id.to_string().starts_with(&prefix));
    match (matches.next(), matches.next()) {
        (Some(thread), None) => Some(thread),
        _ => None,
    }
}

pub fn format_thread_line(position: usize, thread: &ThreadRecord) -> String {
    let id = thread.id.to_string();
    let short_id = id.get(..8).unwrap_or(&id);
    format!("{position:>3}. {} [{short_id}]", thread.title)
}

fn role_label(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "you",
        MessageRole::Assistant => "assistant",
    }
}

/// Output sink shared by the command loop and the renderer task.
#[derive(Clone)]
pub struct Console {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Console {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(out))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn print(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut out = self.out.lock();
        // A closed terminal leaves nothing useful to report to.
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    pub fn line(&self, text: impl AsRef<str>) {
        self.print(&format!("{}\n", text.as_ref()));
    }
}

#[derive(Debug)]
pub enum ViewEvent {
    Messages(Vec<MessageRecord>),
    Snapshot(SessionSnapshot),
    /// A prompt submitted from this console; its user message is not reprinted.
    Echo(String),
    /// An echoed prompt whose submit was rejected.
    Withdraw(String),
}

/// Text rendering of one open thread.
#[derive(Debug, Default)]
pub struct ThreadView {
    printed: usize,
    echoed: VecDeque<String>,
    session: Option<StreamTarget>,
    finished: Option<StreamTarget>,
    streamed: String,
    streamed_thought: String,
    last_reply: String,
}

impl ThreadView {
    /// Returns the text to print for `event`.
    pub fn apply(&mut self, event: ViewEvent, show_thoughts: bool) -> String {
        match event {
            ViewEvent::Echo(prompt) => {
                self.echoed.push_back(prompt);
                String::new()
            }
            ViewEvent::Withdraw(prompt) => {
                if let Some(index) = self.echoed.iter().rposition(|echoed| *echoed == prompt) {
                    self.echoed.remove(index);
                }
                String::new()
            }
            ViewEvent::Messages(messages) => self.apply_messages(messages, show_thoughts),
            ViewEvent::Snapshot(snapshot) => self.apply_snapshot(snapshot, show_thoughts),
        }
    }

    fn apply_messages(&mut self, messages: Vec<MessageRecord>, show_thoughts: bool) -> String {
        if messages.len() < self.printed {
            self.printed = messages.len();
            return String::new();
        }

        let mut out = String::new();
        for message in messages.iter().skip(self.printed) {
            match message.role {
                MessageRole::User => {
                    if self.echoed.front() == Some(&message.content) {
                        self.echoed.pop_front();
                        continue;
                    }
                    out.push_str(&format!("you> {}\n", message.content));
                }
                MessageRole::Assistant => {
                    if !self.streamed.is_empty() && message.content.starts_with(&self.streamed) {
                        out.push_str(&message.content[self.streamed.len()..]);
                        out.push('\n');
                    } else {
                        if show_thoughts && !message.thought.is_empty() {
                            out.push_str(&format!("(thinking) {}\n", message.thought));
                        }
                        out.push_str(&format!(
                            "{}> {}\n",
                            role_label(message.role),
                            message.content
                        ));
                    }
                    self.finished = self.session;
                    self.last_reply = message.content.clone();
                    self.streamed.clear();
                    self.streamed_thought.clear();
                }
            }
        }
        self.printed = messages.len();
        out
    }

    fn apply_snapshot(&mut self, snapshot: SessionSnapshot, show_thoughts: bool) -> String {
        let Some(target) = snapshot.state.target() else {
            return self.apply_settled(&snapshot);
        };
        if self.finished == Some(target) {
            return String::new();
        }
        if self.session != Some(target) {
            self.session = Some(target);
            self.streamed.clear();
            self.streamed_thought.clear();
        }

        let mut out = String::new();
        match &snapshot.state {
            SessionState::Streaming(_) | SessionState::Committing(_) => {
                if matches!(snapshot.state, SessionState::Committing(_))
                    && self.streamed.is_empty()
                    && snapshot.content == self.last_reply
                {
                    return out;
                }
                if show_thoughts
                    && self.streamed.is_empty()
                    && let Some(delta) = snapshot.thought.strip_prefix(self.streamed_thought.as_str())
                    && !delta.is_empty()
                {
                    if self.streamed_thought.is_empty() {
                        out.push_str("(thinking) ");
                    }
                    out.push_str(delta);
                    self.streamed_thought = snapshot.thought.clone();
                }
                if let Some(delta) = snapshot.content.strip_prefix(self.streamed.as_str())
                    && !delta.is_empty()
                {
                    if self.streamed.is_empty() {
                        if !self.streamed_thought.is_empty() {
                            out.push('\n');
                        }
                        out.push_str("assistant> ");
                    }
                    out.push_str(delta);
                    self.streamed = snapshot.content.clone();
                }
            }
            SessionState::Cancelled(_) => {
                self.finished = Some(target);
                out.push_str(self.close_partial_line());
                out.push_str("[reply stopped]\n");
            }
            SessionState::Failed { message, .. } => {
                self.finished = Some(target);
                out.push_str(self.close_partial_line());
                out.push_str(&format!("[reply failed: {message}]\n"));
            }
            SessionState::Idle | SessionState::Dispatching(_) => {}
        }
        out
    }

    /// A failure can be coalesced away by the watch channel; the settled
    /// snapshot still carries its message.
    fn apply_settled(&mut self, snapshot: &SessionSnapshot) -> String {
        let (Some(session), Some(message)) = (self.session, snapshot.last_error.as_ref()) else {
            return String::new();
        };
        if self.finished == Some(session) {
            return String::new();
        }
        self.finished = Some(session);
        format!("{}[reply failed: {message}]\n", self.close_partial_line())
    }

    fn close_partial_line(&mut self) -> &'static str {
        let partial = !self.streamed.is_empty() || !self.streamed_thought.is_empty();
        self.streamed.clear();
        self.streamed_thought.clear();
        if partial { "\n" } else { "" }
    }
}

struct OpenThread {
    thread_id: ThreadId,
    title: String,
    events: mpsc::UnboundedSender<ViewEvent>,
    _messages: LiveQuery,
    tasks: [JoinHandle<()>; 2],
}

impl Drop for OpenThread {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ReplError {
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[derive(Debug, Snafu)]
enum ActionError {
    #[snafu(transparent)]
    Chat { source: ChatError },
    #[snafu(transparent)]
    Settings { source: SettingsError },
}

pub struct Repl {
    coordinator: StreamCoordinator,
    settings: Arc<SettingsStore>,
    console: Console,
    show_thoughts: Arc<AtomicBool>,
    listed: Vec<ThreadRecord>,
    open: Option<OpenThread>,
}

impl Repl {
    pub fn new(
        coordinator: StreamCoordinator,
        settings: Arc<SettingsStore>,
        console: Console,
    ) -> Self {
        let show_thoughts = settings.settings().chat.show_thoughts;
        Self {
            coordinator,
            settings,
            console,
            show_thoughts: Arc::new(AtomicBool::new(show_thoughts)),
            listed: Vec::new(),
            open: None,
        }
    }

    pub fn open_thread_id(&self) -> Option<ThreadId> {
        self.open.as_ref().map(|open| open.thread_id)
    }

    pub async fn run<R>(&mut self, input: R) -> Result<(), ReplError>
    where
        R: AsyncBufRead + Unpin,
    {
        self.console.line("quill: type /help for commands");
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
            stage: "read-line",
        })? {
            if let Flow::Quit = self.handle_line(&line).await {
                break;
            }
        }
        self.close();
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> Flow {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(error) => {
                self.console.line(error.to_string());
                return Flow::Continue;
            }
        };

        match self.execute(command).await {
            Ok(flow) => flow,
            Err(error) => {
                tracing::debug!(error = %error, "command failed");
                self.console.line(format!("error: {error}"));
                Flow::Continue
            }
        }
    }

    async fn execute(&mut self, command: Command) -> Result<Flow, ActionError> {
        match command {
            Command::Empty => {}
            Command::Help => self.console.line(HELP_TEXT),
            Command::Quit => return Ok(Flow::Quit),
            Command::New(title) => {
                let repository = self.coordinator.repository();
                let thread_id = repository.create_thread(&title).await?;
                let thread = repository.get_thread(thread_id).await?;
                self.open(thread);
            }
            Command::List(filter) => self.list(&filter).await?,
            Command::Open(argument) => match self.resolve(&argument).await? {
                Some(thread) => self.open(thread),
                None => self.console.line(format!("no single thread matches `{argument}`")),
            },
            Command::Delete(argument) => self.delete(&argument).await?,
            Command::Stop => self.stop(),
            Command::Tidy(text) => {
                let tidied = tidy_prompt(&text);
                self.console.line(format!("tidied: {tidied}"));
                self.say(&tidied)?;
            }
            Command::Model(model) => self.model(model)?,
            Command::Thoughts => {
                let enabled = !self.show_thoughts.fetch_xor(true, Ordering::AcqRel);
                let state = if enabled { "on" } else { "off" };
                self.console.line(format!("reasoning output {state}"));
            }
            Command::Say(text) => self.say(&text)?,
        }
        Ok(Flow::Continue)
    }

    async fn list(&mut self, filter: &str) -> Result<(), ActionError> {
        let threads = self.coordinator.repository().list_threads().await?;
        self.listed = filter_threads(&threads, filter).into_iter().cloned().collect();
        if self.listed.is_empty() {
            self.console.line("no threads");
        }
        for (index, thread) in self.listed.iter().enumerate() {
            self.console.line(format_thread_line(index + 1, thread));
        }
        Ok(())
    }

    async fn resolve(&self, argument: &str) -> Result<Option<ThreadRecord>, ActionError> {
        let all = self.coordinator.repository().list_threads().await?;
        Ok(resolve_thread(&self.listed, &all, argument).cloned())
    }

    async fn delete(&mut self, argument: &str) -> Result<(), ActionError> {
        let Some(thread) = self.resolve(argument).await? else {
            self.console.line(format!("no single thread matches `{argument}`"));
            return Ok(());
        };

        if self.open_thread_id() == Some(thread.id) {
            self.close();
        }
        self.coordinator.delete_thread(thread.id).await?;
        self.listed.retain(|listed| listed.id != thread.id);
        self.console.line(format!("deleted `{}`", thread.title));
        Ok(())
    }

    fn stop(&self) {
        let Some(thread_id) = self.open_thread_id() else {
            self.console.line("no thread is open");
            return;
        };
        if !self.coordinator.cancel(thread_id) {
            self.console.line("no reply to stop");
        }
    }

    fn say(&self, text: &str) -> Result<(), ActionError> {
        let Some(open) = self.open.as_ref() else {
            self.console.line("no thread is open, use /new <title> or /open <n>");
            return Ok(());
        };

        let prompt = text.trim();
        if exceeds_prompt_budget(prompt) {
            self.console.line(format!(
                "prompt is {} characters, the limit is {MAX_PROMPT_CHARS}",
                prompt_char_count(prompt)
            ));
            return Ok(());
        }

        // Queued ahead of submit so it reaches the renderer before the stored
        // user message does.
        let _ = open.events.send(ViewEvent::Echo(prompt.to_string()));
        // The session runs on its own task; the renderer shows its progress.
        if let Err(error) = self.coordinator.submit(open.thread_id, prompt) {
            let _ = open.events.send(ViewEvent::Withdraw(prompt.to_string()));
            return Err(error.into());
        }
        Ok(())
    }

    fn model(&self, model: Option<String>) -> Result<(), ActionError> {
        let Some(model) = model else {
            let current = self
                .coordinator
                .effective_model()
                .unwrap_or_else(|| "(no provider configured)".to_string());
            self.console.line(format!("model: {current}"));
            return Ok(());
        };

        let settings = self.settings.set_model(&model)?;
        self.coordinator.update_config(settings.coordinator_config());
        self.console.line(format!("model set to {}", settings.provider.model));
        Ok(())
    }

    fn open(&mut self, thread: ThreadRecord) {
        self.close();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let messages_tx = events_tx.clone();
        let messages = self
            .coordinator
            .repository()
            .watch_messages(thread.id, move |result| match result {
                Ok(messages) => {
                    let _ = messages_tx.send(ViewEvent::Messages(messages));
                }
                Err(error) => tracing::warn!(error = %error, "message view refresh failed"),
            });

        let mut snapshots = self.coordinator.watch(thread.id);
        let snapshot_tx = events_tx.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                let snapshot = snapshots.borrow_and_update().clone();
                if snapshot_tx.send(ViewEvent::Snapshot(snapshot)).is_err() {
                    return;
                }
                if snapshots.changed().await.is_err() {
                    return;
                }
            }
        });

        let console = self.console.clone();
        let show_thoughts = self.show_thoughts.clone();
        let renderer = tokio::spawn(async move {
            let mut view = ThreadView::default();
            while let Some(event) = events_rx.recv().await {
                console.print(&view.apply(event, show_thoughts.load(Ordering::Acquire)));
            }
        });

        self.console.line(format!("== {} ==", thread.title));
        tracing::debug!(thread_id = %thread.id, "thread opened");
        self.open = Some(OpenThread {
            thread_id: thread.id,
            title: thread.title,
            events: events_tx,
            _messages: messages,
            tasks: [forwarder, renderer],
        });
    }

    fn close(&mut self) {
        if let Some(open) = self.open.take() {
            tracing::debug!(thread_id = %open.thread_id, title = %open.title, "thread closed");
        }
    }
}
