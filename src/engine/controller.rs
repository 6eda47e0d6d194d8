//! The engine command loop
//!
//! The controller is a single task owning all conversation state. Hosts
//! talk to it through [`EngineHandle`]: commands go in over a channel, the
//! derived view comes back out through a watch. The in-flight generation
//! stream runs as a background task and reports progress and its terminal
//! outcome over an internal event channel, so cancellation never races
//! persistence.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::state::{ActiveSession, ChatState, EngineView};
use crate::config::EngineConfig;
use crate::error::{ApiError, EngineError, Notice};
use crate::log::{
    HttpInteractionStore, Interaction, InteractionKind, InteractionStore, NewInteraction,
};
use crate::session::SessionIndex;
use crate::stream::{
    consume, CompletionClient, CompletionRequest, HttpCompletionClient, StreamOutcome,
};
use crate::tools::{validate_params, HttpToolBackend, ToolBackend, ToolCatalog};

const COMMAND_BUFFER: usize = 32;

type Reply = oneshot::Sender<Result<(), EngineError>>;

enum Command {
    SendMessage { text: String, reply: Reply },
    Stop,
    Regenerate { reply: Reply },
    NewSession { reply: Reply },
    SelectSession { index: usize, reply: Reply },
    DeleteSession { index: usize, reply: Reply },
    DeleteAll { reply: Reply },
    InvokeTool {
        name: String,
        params: Map<String, Value>,
        reply: Reply,
    },
    MarkAllRead { reply: Reply },
    DismissNotice,
}

enum EngineEvent {
    /// Accumulated text republished after a chunk completed characters.
    StreamDelta(String),
    /// The in-flight stream reached a terminal outcome.
    StreamClosed(StreamOutcome),
}

/// The conversation controller task.
pub struct ChatEngine {
    store: Arc<dyn InteractionStore>,
    completions: Arc<dyn CompletionClient>,
    tools: ToolCatalog,

    state: ChatState,
    interactions: Vec<Interaction>,
    index: SessionIndex,
    active: ActiveSession,
    partial: String,
    notice: Option<Notice>,
    stream_cancel: Option<CancellationToken>,

    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    view_tx: watch::Sender<EngineView>,
}

/// Host-facing handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<EngineView>,
}

impl ChatEngine {
    /// Start an engine over the given seams and return its handle.
    ///
    /// The initial log fetch happens inside the spawned task; a failure
    /// there surfaces as a notice, not a startup error, and the engine
    /// resynchronizes on the next successful mutation.
    pub fn spawn(
        store: Arc<dyn InteractionStore>,
        completions: Arc<dyn CompletionClient>,
        tool_backend: Arc<dyn ToolBackend>,
    ) -> EngineHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(EngineView::default());

        let engine = ChatEngine {
            store,
            completions,
            tools: ToolCatalog::new(tool_backend),
            state: ChatState::Idle,
            interactions: Vec::new(),
            index: SessionIndex::new(),
            active: ActiveSession::MostRecent,
            partial: String::new(),
            notice: None,
            stream_cancel: None,
            commands: command_rx,
            events: event_rx,
            event_tx,
            view_tx,
        };
        tokio::spawn(engine.run());

        EngineHandle {
            commands: command_tx,
            view: view_rx,
        }
    }

    /// Start an engine wired to the platform's REST interfaces.
    pub fn connect(config: &EngineConfig) -> EngineHandle {
        Self::spawn(
            Arc::new(HttpInteractionStore::new(config)),
            Arc::new(HttpCompletionClient::new(config)),
            Arc::new(HttpToolBackend::new(config)),
        )
    }

    async fn run(mut self) {
        tracing::info!("starting assistant engine");

        if let Err(err) = self.resync().await {
            tracing::warn!(error = %err, "initial interaction fetch failed");
            self.notice = Some(Notice::persistence(&err));
        }
        self.publish();

        loop {
            tokio::select! {
                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                    self.publish();
                }
                command = self.commands.recv() => match command {
                    Some(command) => {
                        self.handle_command(command).await;
                        self.publish();
                    }
                    None => break,
                },
            }
        }

        if let Some(cancel) = self.stream_cancel.take() {
            cancel.cancel();
        }
        tracing::info!("assistant engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendMessage { text, reply } => {
                let _ = reply.send(self.send_message(text).await);
            }
            Command::Stop => self.stop(),
            Command::Regenerate { reply } => {
                let _ = reply.send(self.regenerate().await);
            }
            Command::NewSession { reply } => {
                let _ = reply.send(self.new_session().await);
            }
            Command::SelectSession { index, reply } => {
                let _ = reply.send(self.select_session(index));
            }
            Command::DeleteSession { index, reply } => {
                let _ = reply.send(self.delete_session(index).await);
            }
            Command::DeleteAll { reply } => {
                let _ = reply.send(self.delete_all().await);
            }
            Command::InvokeTool { name, params, reply } => {
                let _ = reply.send(self.invoke_tool(name, &params).await);
            }
            Command::MarkAllRead { reply } => {
                let _ = reply.send(self.mark_all_read().await);
            }
            Command::DismissNotice => self.notice = None,
        }
    }

    async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::StreamDelta(text) => {
                if self.state == ChatState::Streaming {
                    self.partial = text;
                }
            }
            EngineEvent::StreamClosed(outcome) => {
                if self.state == ChatState::Streaming {
                    self.finish_stream(outcome).await;
                } else {
                    tracing::debug!("discarding stale stream outcome");
                }
            }
        }
    }

    // ==================== Messaging ====================

    async fn send_message(&mut self, text: String) -> Result<(), EngineError> {
        if self.state.is_busy() {
            return Err(EngineError::Busy);
        }
        self.state = ChatState::Submitting;
        self.publish();

        if let Err(err) = self.persist(NewInteraction::user(&text)).await {
            self.state = ChatState::Idle;
            return Err(EngineError::Persistence(err));
        }

        self.start_stream(text);
        Ok(())
    }

    /// Re-run generation for the most recent user message without
    /// appending a new user record.
    async fn regenerate(&mut self) -> Result<(), EngineError> {
        if self.state.is_busy() {
            return Err(EngineError::Busy);
        }
        let prompt = self
            .interactions
            .iter()
            .rev()
            .find(|r| r.kind == InteractionKind::UserMessage)
            .map(|r| r.content.clone())
            .ok_or(EngineError::NothingToRegenerate)?;

        self.state = ChatState::Submitting;
        self.publish();
        self.start_stream(prompt);
        Ok(())
    }

    fn start_stream(&mut self, prompt: String) {
        let request = CompletionRequest::new(prompt);
        let cancel = CancellationToken::new();
        self.stream_cancel = Some(cancel.clone());
        self.partial.clear();
        self.state = ChatState::Streaming;

        let completions = Arc::clone(&self.completions);
        let events = self.event_tx.clone();
        tokio::spawn(async move {
            let outcome = match completions.open(&request).await {
                Ok(body) => {
                    let deltas = events.clone();
                    consume(body, &cancel, move |text| {
                        let _ = deltas.send(EngineEvent::StreamDelta(text.to_string()));
                    })
                    .await
                }
                Err(err) => StreamOutcome::Failed(err),
            };
            let _ = events.send(EngineEvent::StreamClosed(outcome));
        });
    }

    /// Request cancellation of the in-flight stream, if any. The engine
    /// returns to `Idle` when the stream task reports back with whatever
    /// text had accumulated.
    fn stop(&mut self) {
        if let Some(cancel) = &self.stream_cancel {
            tracing::debug!("stopping in-flight generation");
            cancel.cancel();
        }
    }

    async fn finish_stream(&mut self, outcome: StreamOutcome) {
        self.stream_cancel = None;

        let text = match outcome {
            StreamOutcome::Completed(text) => text,
            StreamOutcome::Cancelled(text) => {
                tracing::info!(chars = text.chars().count(), "generation stopped; keeping partial output");
                text
            }
            StreamOutcome::Failed(err) => {
                // The prompt is already persisted, so a retry can resend it
                // without duplicating anything.
                self.notice = Some(Notice::transport(&err));
                self.partial.clear();
                self.state = ChatState::Idle;
                return;
            }
        };

        if !text.is_empty() {
            let _ = self.persist(NewInteraction::assistant(&text)).await;
        }
        self.partial.clear();
        self.state = ChatState::Idle;
    }

    // ==================== Sessions ====================

    async fn new_session(&mut self) -> Result<(), EngineError> {
        if self.state.is_busy() {
            return Err(EngineError::Busy);
        }
        self.persist(NewInteraction::boundary(None))
            .await
            .map_err(EngineError::Persistence)?;
        self.active = ActiveSession::MostRecent;
        Ok(())
    }

    fn select_session(&mut self, index: usize) -> Result<(), EngineError> {
        let count = self.index.sessions().len();
        if count == 0 {
            self.active = ActiveSession::MostRecent;
            return Ok(());
        }
        self.active = ActiveSession::Pinned(index.min(count - 1));
        Ok(())
    }

    async fn delete_session(&mut self, index: usize) -> Result<(), EngineError> {
        if self.state.is_busy() {
            return Err(EngineError::Busy);
        }
        let Some(session) = self.index.sessions().get(index).cloned() else {
            tracing::warn!(index, "delete for a session that no longer exists");
            return Ok(());
        };

        let ids: Vec<i64> = self.interactions[session.range()]
            .iter()
            .map(|r| r.id)
            .collect();
        if let Err(err) = self.store.bulk_delete(&ids).await {
            self.notice = Some(Notice::persistence(&err));
            self.resync_after_failure().await;
            return Err(EngineError::Persistence(err));
        }

        self.interactions.drain(session.range());
        self.index.rebuild(&self.interactions);
        self.active = if index > 0 {
            ActiveSession::Pinned(index - 1)
        } else {
            ActiveSession::MostRecent
        };
        Ok(())
    }

    async fn delete_all(&mut self) -> Result<(), EngineError> {
        if self.state.is_busy() {
            return Err(EngineError::Busy);
        }
        if let Err(err) = self.store.delete_all().await {
            self.notice = Some(Notice::persistence(&err));
            self.resync_after_failure().await;
            return Err(EngineError::Persistence(err));
        }
        self.interactions.clear();
        self.index.rebuild(&self.interactions);
        self.active = ActiveSession::MostRecent;
        Ok(())
    }

    // ==================== Tools ====================

    async fn invoke_tool(
        &mut self,
        name: String,
        params: &Map<String, Value>,
    ) -> Result<(), EngineError> {
        if self.state.is_busy() {
            return Err(EngineError::Busy);
        }
        self.state = ChatState::ToolPending;
        self.publish();

        let descriptor = match self.tools.find(&name).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                self.state = ChatState::Idle;
                return Err(EngineError::UnknownTool(name));
            }
            Err(err) => {
                self.state = ChatState::Idle;
                self.notice = Some(Notice::transport(&err));
                return Err(EngineError::Transport(err));
            }
        };

        // Field-level validation happens before any execution request; bad
        // input never leaves the client.
        let field_errors = validate_params(&descriptor, params);
        if !field_errors.is_empty() {
            self.state = ChatState::Idle;
            return Err(EngineError::Validation(field_errors));
        }

        self.state = ChatState::ToolExecuting;
        self.publish();

        let result = match self.tools.execute(&name, params).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.state = ChatState::Idle;
                self.notice = Some(Notice::transport(&err));
                return Err(EngineError::Transport(err));
            }
        };

        // Success or failure, the invocation lands in the log: the
        // conversation is the audit trail of actions taken for the user.
        let (content, ok) = if result.ok {
            let serialized = result
                .result
                .map_or_else(|| "null".to_string(), |value| value.to_string());
            (serialized, true)
        } else {
            let message = result
                .error
                .unwrap_or_else(|| "tool execution failed".to_string());
            (message, false)
        };

        let persisted = self.persist(NewInteraction::tool_result(&name, content, ok)).await;
        self.state = ChatState::Idle;
        persisted.map_err(EngineError::Persistence)
    }

    async fn mark_all_read(&mut self) -> Result<(), EngineError> {
        self.store
            .mark_all_read()
            .await
            .map_err(EngineError::Persistence)?;
        for record in &mut self.interactions {
            record.is_read = true;
        }
        Ok(())
    }

    // ==================== Persistence ====================

    /// Append a record, updating the local log and session index. On
    /// failure the engine resynchronizes from the store so in-memory state
    /// cannot drift from a half-applied mutation.
    async fn persist(&mut self, draft: NewInteraction) -> Result<(), ApiError> {
        match self.store.create(&draft).await {
            Ok(stored) => {
                self.interactions.push(stored);
                self.index.sync(&self.interactions);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to append interaction");
                self.notice = Some(Notice::persistence(&err));
                self.resync_after_failure().await;
                Err(err)
            }
        }
    }

    async fn resync(&mut self) -> Result<(), ApiError> {
        let log = self.store.list().await?;
        self.interactions = log;
        self.index.rebuild(&self.interactions);
        Ok(())
    }

    async fn resync_after_failure(&mut self) {
        if let Err(err) = self.resync().await {
            tracing::warn!(error = %err, "resync after failed mutation also failed");
        }
    }

    // ==================== View ====================

    fn publish(&self) {
        let sessions = self.index.sessions().to_vec();
        let active_session = self.active.resolve(sessions.len());
        let active_session_messages = active_session
            .map(|i| self.interactions[sessions[i].range()].to_vec())
            .unwrap_or_default();

        self.view_tx.send_replace(EngineView {
            sessions,
            active_session,
            active_session_messages,
            is_streaming: self.state == ChatState::Streaming,
            partial_text: self.partial.clone(),
            notice: self.notice.clone(),
            state: self.state,
        });
    }
}

impl EngineHandle {
    async fn call(&self, make: impl FnOnce(Reply) -> Command) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::Closed)?;
        reply_rx.await.map_err(|_| EngineError::Closed)?
    }

    /// Persist a user message and start streaming the reply.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), EngineError> {
        let text = text.into();
        self.call(|reply| Command::SendMessage { text, reply }).await
    }

    /// Stop the in-flight generation. Partial output is kept and persisted;
    /// a no-op when nothing is streaming.
    pub async fn stop(&self) {
        let _ = self.commands.send(Command::Stop).await;
    }

    /// Stream a fresh reply to the most recent user message, without
    /// appending a new user record.
    pub async fn regenerate(&self) -> Result<(), EngineError> {
        self.call(|reply| Command::Regenerate { reply }).await
    }

    /// Append a session boundary; the new session becomes active.
    pub async fn new_session(&self) -> Result<(), EngineError> {
        self.call(|reply| Command::NewSession { reply }).await
    }

    pub async fn select_session(&self, index: usize) -> Result<(), EngineError> {
        self.call(|reply| Command::SelectSession { index, reply })
            .await
    }

    /// Delete every interaction of the given session.
    pub async fn delete_session(&self, index: usize) -> Result<(), EngineError> {
        self.call(|reply| Command::DeleteSession { index, reply })
            .await
    }

    /// Wipe the whole interaction log.
    pub async fn delete_all(&self) -> Result<(), EngineError> {
        self.call(|reply| Command::DeleteAll { reply }).await
    }

    /// Validate and execute a tool; the outcome is appended to the log.
    pub async fn invoke_tool(
        &self,
        name: impl Into<String>,
        params: Map<String, Value>,
    ) -> Result<(), EngineError> {
        let name = name.into();
        self.call(|reply| Command::InvokeTool { name, params, reply })
            .await
    }

    pub async fn mark_all_read(&self) -> Result<(), EngineError> {
        self.call(|reply| Command::MarkAllRead { reply }).await
    }

    pub async fn dismiss_notice(&self) {
        let _ = self.commands.send(Command::DismissNotice).await;
    }

    /// Latest published view.
    pub fn view(&self) -> EngineView {
        self.view.borrow().clone()
    }

    /// Watch the view for changes.
    pub fn subscribe(&self) -> watch::Receiver<EngineView> {
        self.view.clone()
    }
}
