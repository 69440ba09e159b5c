//! Chat session: ordered message history, conversation id and turn lifecycle.
//!
//! A session accepts one turn at a time (`idle -> sending -> idle`). Streamed fragments
//! are merged into the in-flight assistant message as they arrive. `clear()` may be called
//! from another task while a turn is streaming; it cancels that turn.

use crate::config::DiagnosticsConfig;
use crate::diagnostics::{DiagnosticResult, Diagnostics};
use crate::llm::{AssistantBackend, DifyError, ErrorKind, StreamOutcome};
use crate::logger::Logger;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

const CATEGORY: &str = "CHAT_SESSION";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single message in a session. Ids increase within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: u64,
    pub role: Role,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Testing,
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigStatus {
    pub is_configured: bool,
    pub has_api_key: bool,
    pub connection_status: ConnectionStatus,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub conversation_id: Option<String>,
    pub turn_count: u32,
}

/// Read-only snapshot of everything a UI renders, taken under one lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub messages: Vec<Message>,
    pub busy: bool,
    pub last_error: Option<String>,
    pub config_status: ConfigStatus,
    pub conversation: ConversationState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Text was empty or whitespace.
    Empty,
    /// Credentials or endpoint are missing or invalid.
    NotConfigured,
    /// Another turn is in flight.
    Busy,
}

/// How a `submit` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Rejected(RejectReason),
    Answered(StreamOutcome),
    Failed(ErrorKind),
    Cancelled,
}

struct SessionState {
    messages: Vec<Message>,
    next_id: u64,
    conversation: ConversationState,
    busy: bool,
    last_error: Option<String>,
    status: ConfigStatus,
    /// Bumped by every submit and clear; callbacks of older turns are ignored.
    generation: u64,
    cancel: Option<CancellationToken>,
    streaming_id: Option<u64>,
}

impl SessionState {
    fn push(&mut self, role: Role, text: impl Into<String>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.messages.push(Message {
            id,
            role,
            text: text.into(),
            created_at: Utc::now(),
        });
        id
    }

    fn streaming_message(&mut self) -> Option<&mut Message> {
        let id = self.streaming_id?;
        self.messages.iter_mut().rev().find(|m| m.id == id)
    }

    fn append_chunk(&mut self, chunk: &str) {
        if let Some(msg) = self.streaming_message() {
            msg.text.push_str(chunk);
            return;
        }
        let id = self.push(Role::Assistant, chunk);
        self.streaming_id = Some(id);
    }

    fn end_turn(&mut self) {
        self.busy = false;
        self.cancel = None;
        self.streaming_id = None;
    }
}

/// Handle to one chat session. Clones share the same history.
pub struct ChatSession<B> {
    backend: Arc<B>,
    state: Arc<Mutex<SessionState>>,
    logger: Logger,
}

impl<B> Clone for ChatSession<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            state: Arc::clone(&self.state),
            logger: self.logger.clone(),
        }
    }
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn not_configured_message(problems: &[String]) -> String {
    let mut msg = String::from("The shopping assistant is not configured yet.\n");
    for p in problems {
        msg.push_str(&format!("\n- {}", p));
    }
    msg.push_str("\n\nSet the API key and base URL, then restart the assistant.");
    msg
}

impl<B: AssistantBackend> ChatSession<B> {
    pub fn new(backend: B, logger: Logger) -> Self {
        Self::from_shared(Arc::new(backend), logger)
    }

    pub fn from_shared(backend: Arc<B>, logger: Logger) -> Self {
        let check = backend.settings().check();
        let state = SessionState {
            messages: Vec::new(),
            next_id: 1,
            conversation: ConversationState::default(),
            busy: false,
            last_error: None,
            status: ConfigStatus {
                is_configured: check.is_configured,
                has_api_key: check.has_api_key,
                connection_status: ConnectionStatus::Unknown,
                last_error: None,
            },
            generation: 0,
            cancel: None,
            streaming_id: None,
        };
        Self {
            backend,
            state: Arc::new(Mutex::new(state)),
            logger,
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }

    /// Run one turn for `text`. Rejected without side effects on history when the text is
    /// blank, the backend is not configured, or a turn is already in flight.
    pub async fn submit(&self, text: &str) -> TurnOutcome {
        if text.trim().is_empty() {
            return TurnOutcome::Rejected(RejectReason::Empty);
        }

        let (generation, cancel, conversation_id) = {
            let mut s = self.state();
            if !s.status.is_configured || !s.status.has_api_key {
                let problems = self.backend.settings().check().problems;
                self.logger.error::<()>(CATEGORY, "assistant not configured, message not sent", None, None);
                s.last_error = Some(not_configured_message(&problems));
                return TurnOutcome::Rejected(RejectReason::NotConfigured);
            }
            if s.busy {
                self.logger.warn::<()>(CATEGORY, "turn already in flight, message ignored", None);
                return TurnOutcome::Rejected(RejectReason::Busy);
            }
            s.push(Role::User, text);
            s.busy = true;
            s.last_error = None;
            s.generation += 1;
            let cancel = CancellationToken::new();
            s.cancel = Some(cancel.clone());
            self.logger.info(
                CATEGORY,
                "user message submitted",
                Some(&json!({
                    "messageLength": text.chars().count(),
                    "connectionStatus": s.status.connection_status,
                    "conversationId": s.conversation.conversation_id,
                })),
            );
            (s.generation, cancel, s.conversation.conversation_id.clone())
        };

        let shared = Arc::clone(&self.state);
        let mut on_chunk = move |chunk: &str| {
            let mut s = lock(&shared);
            if s.generation == generation {
                s.append_chunk(chunk);
            }
        };
        let result = self
            .backend
            .stream_turn(text, conversation_id.as_deref(), &mut on_chunk, &cancel)
            .await;

        let mut s = self.state();
        if s.generation != generation {
            self.logger.info::<()>(CATEGORY, "turn finished after the session was cleared; result dropped", None);
            return TurnOutcome::Cancelled;
        }
        match result {
            Ok(outcome) => {
                // The server's full text is authoritative over the concatenated chunks.
                match s.streaming_message() {
                    Some(msg) => msg.text = outcome.full_text.clone(),
                    None if !outcome.full_text.is_empty() => {
                        s.push(Role::Assistant, outcome.full_text.clone());
                    }
                    None => {}
                }
                if let Some(ref id) = outcome.conversation_id {
                    s.conversation.conversation_id = Some(id.clone());
                }
                s.conversation.turn_count += 1;
                s.status.connection_status = ConnectionStatus::Connected;
                s.status.last_error = None;
                s.end_turn();
                self.logger.info(
                    CATEGORY,
                    "assistant reply completed",
                    Some(&json!({
                        "responseLength": outcome.full_text.chars().count(),
                        "conversationId": s.conversation.conversation_id,
                        "turnCount": s.conversation.turn_count,
                    })),
                );
                TurnOutcome::Answered(outcome)
            }
            Err(DifyError::Cancelled) => {
                s.end_turn();
                self.logger.info::<()>(CATEGORY, "turn cancelled", None);
                TurnOutcome::Cancelled
            }
            Err(e) => {
                let guidance = e.guidance();
                s.push(Role::Assistant, guidance.clone());
                s.last_error = Some(guidance);
                s.status.connection_status = ConnectionStatus::Failed;
                s.status.last_error = Some(e.to_string());
                s.end_turn();
                self.logger.error(
                    CATEGORY,
                    "assistant call failed",
                    Some(&json!({ "content": text.chars().take(100).collect::<String>() })),
                    Some(e.error_info()),
                );
                TurnOutcome::Failed(e.kind())
            }
        }
    }

    /// Stop the in-flight turn, keeping history. No-op when idle.
    pub fn cancel(&self) {
        if let Some(token) = self.state().cancel.as_ref() {
            token.cancel();
        }
    }

    /// Reset history, conversation id and error state. Cancels an in-flight turn.
    pub fn clear(&self) {
        let mut s = self.state();
        if let Some(token) = s.cancel.take() {
            token.cancel();
        }
        s.generation += 1;
        s.messages.clear();
        s.next_id = 1;
        s.conversation = ConversationState::default();
        s.busy = false;
        s.streaming_id = None;
        s.last_error = None;
        s.status.connection_status = ConnectionStatus::Unknown;
        s.status.last_error = None;
        self.logger.info::<()>(CATEGORY, "conversation history cleared", None);
    }

    /// Check the backend connection and record the result in the config status.
    pub async fn test_connection(&self) -> ConnectionStatus {
        {
            let mut s = self.state();
            if !s.status.has_api_key {
                self.logger.warn::<()>(CATEGORY, "API key not configured, connection test skipped", None);
                s.status.connection_status = ConnectionStatus::Failed;
                s.status.last_error = Some(format!(
                    "API key is missing or invalid\nSet DIFY_API_KEY or assistant.apiKey\n\nCurrent API address: {}",
                    self.backend.settings().base_url
                ));
                return ConnectionStatus::Failed;
            }
            s.status.connection_status = ConnectionStatus::Testing;
        }

        let check = self.backend.check_connection().await;

        let mut s = self.state();
        if check.ok {
            self.logger.info::<()>(CATEGORY, "connection test succeeded", None);
            s.status.connection_status = ConnectionStatus::Connected;
            s.status.last_error = None;
        } else {
            let base_url = &self.backend.settings().base_url;
            let error = check.error.unwrap_or_else(|| "connection failed".to_string());
            self.logger.error(CATEGORY, "connection test failed", Some(&json!({ "error": error })), None);
            s.status.connection_status = ConnectionStatus::Failed;
            s.status.last_error = Some(format!(
                "{}\n\nTroubleshooting:\n1. check the network connection\n2. confirm the API address: {}\n3. verify the API key\n4. confirm the server is running",
                error, base_url
            ));
        }
        s.status.connection_status
    }

    /// Run the connection diagnostics against this session's backend address.
    /// Session state is left untouched.
    pub async fn run_diagnostics(
        &self,
        config: DiagnosticsConfig,
        on_update: &mut (dyn FnMut(&[DiagnosticResult]) + Send),
    ) -> Vec<DiagnosticResult> {
        let base_url = self.backend.settings().base_url.clone();
        Diagnostics::new(base_url, config, self.logger.clone())
            .run(on_update)
            .await
    }

    pub fn view(&self) -> SessionView {
        let s = self.state();
        SessionView {
            messages: s.messages.clone(),
            busy: s.busy,
            last_error: s.last_error.clone(),
            config_status: s.status.clone(),
            conversation: s.conversation.clone(),
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state().messages.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state().busy
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    pub fn config_status(&self) -> ConfigStatus {
        self.state().status.clone()
    }

    pub fn conversation(&self) -> ConversationState {
        self.state().conversation.clone()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}
