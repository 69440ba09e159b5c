//! Dify chat-app API client (`{baseUrl}/chat-messages`, `/conversations`).
//! Supports streaming (event-stream) and blocking chat, plus a connection check.

use crate::config::{AssistantSettings, ContextInputs};
use crate::llm::sse::{Frame, FrameDecoder};
use crate::logger::{ErrorInfo, Logger};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CATEGORY: &str = "DIFY_API";
const PREVIEW_CHARS: usize = 100;

/// Client for the Dify chat API. Stateless per call: holds settings and a connection pool only.
#[derive(Clone)]
pub struct DifyClient {
    settings: AssistantSettings,
    client: reqwest::Client,
    logger: Logger,
}

/// Classified failure of one call.
#[derive(Debug, thiserror::Error)]
pub enum DifyError {
    #[error("assistant backend is not configured: {0}")]
    NotConfigured(String),
    #[error("network error: cannot reach {endpoint}: {source}")]
    Network {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {endpoint} timed out after {after:?}")]
    Timeout { endpoint: String, after: Duration },
    #[error("assistant backend rejected the request: {status} {reason} - {body}")]
    Rejected {
        status: u16,
        reason: String,
        body: String,
    },
    #[error("assistant backend error: {code} - {message}")]
    Backend { code: String, message: String },
    #[error("invalid response from assistant backend: {0}")]
    InvalidResponse(String),
    #[error("request cancelled")]
    Cancelled,
}

/// Coarse error class, for status handling in callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Configuration,
    Network,
    Timeout,
    Rejected,
    Backend,
    InvalidResponse,
    Cancelled,
}

impl DifyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DifyError::NotConfigured(_) => ErrorKind::Configuration,
            DifyError::Network { .. } => ErrorKind::Network,
            DifyError::Timeout { .. } => ErrorKind::Timeout,
            DifyError::Rejected { .. } => ErrorKind::Rejected,
            DifyError::Backend { .. } => ErrorKind::Backend,
            DifyError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            DifyError::Cancelled => ErrorKind::Cancelled,
        }
    }

    fn name(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Network => "NetworkError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Rejected => "RejectedError",
            ErrorKind::Backend => "BackendError",
            ErrorKind::InvalidResponse => "InvalidResponseError",
            ErrorKind::Cancelled => "CancelledError",
        }
    }

    pub fn error_info(&self) -> ErrorInfo {
        ErrorInfo::from_error(self.name(), self)
    }

    /// User-facing explanation: what went wrong and what to check.
    pub fn guidance(&self) -> String {
        match self {
            DifyError::NotConfigured(detail) => format!(
                "The shopping assistant is not configured.\n\n{}\n\nSteps:\n- set DIFY_API_KEY to your app API key\n- set DIFY_BASE_URL, e.g. https://api.dify.ai/v1\n- restart the assistant",
                detail
            ),
            DifyError::Network { endpoint, .. } => format!(
                "Network connection failed: cannot reach {}\n\nPossible causes:\n- the server is not running or not reachable\n- a network, firewall or proxy problem\n- the server rejects cross-origin requests (CORS)\n\nNext steps:\n- run the connection diagnostics\n- check the API address\n- contact the server administrator",
                endpoint
            ),
            DifyError::Timeout { endpoint, after } => format!(
                "The server took too long to respond ({:?}).\n\nPossible causes:\n- unstable network connection\n- server under heavy load\n- wrong API address: {}\n\nNext steps:\n- check the network connection\n- run the connection diagnostics\n- try again later",
                after, endpoint
            ),
            DifyError::Rejected { status, reason, body } => format!(
                "The assistant API refused the request ({} {}).\n{}\n\nPlease check:\n- the API key is correct\n- the server address is reachable\n- run the connection diagnostics",
                status, reason, body
            ),
            DifyError::Backend { code, message } => format!(
                "The assistant reported an error: {} - {}\n\nPlease try again; if it persists, check the assistant app on the server.",
                code, message
            ),
            DifyError::InvalidResponse(detail) => format!(
                "The assistant API returned a response that could not be read: {}",
                detail
            ),
            DifyError::Cancelled => "The request was cancelled.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    Streaming,
    Blocking,
}

/// Body of POST /chat-messages.
#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    query: &'a str,
    response_mode: ResponseMode,
    user: &'a str,
    inputs: InputsBody<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    auto_generate_name: bool,
}

#[derive(Debug, Serialize)]
struct InputsBody<'a> {
    user_level: &'a str,
    budget_range: &'a str,
    sport_focus: &'a str,
}

impl<'a> From<&'a ContextInputs> for InputsBody<'a> {
    fn from(i: &'a ContextInputs) -> Self {
        Self {
            user_level: &i.user_level,
            budget_range: &i.budget_range,
            sport_focus: &i.sport_focus,
        }
    }
}

/// One decoded stream event, tagged by `event`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Message(AnswerEvent),
    AgentMessage(AnswerEvent),
    MessageEnd(EndEvent),
    Error(ErrorEvent),
    Ping,
    /// agent_thought, message_file, tts_message, message_replace, ...
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AnswerEvent {
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EndEvent {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorEvent {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Final state of a streamed turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOutcome {
    pub full_text: String,
    pub conversation_id: Option<String>,
}

/// Blocking-mode answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChatAnswer {
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Result of [`DifyClient::test_connection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionCheck {
    pub ok: bool,
    pub error: Option<String>,
}

impl ConnectionCheck {
    fn ok() -> Self {
        Self { ok: true, error: None }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConversationPage {
    #[serde(default)]
    pub data: Vec<ConversationSummary>,
    #[serde(default)]
    pub has_more: bool,
}

/// What interrupted a guarded wait.
enum Interrupt {
    Timeout,
    Cancelled,
}

/// Race `fut` against the timeout and the cancel token. Dropping `fut` aborts the transport.
async fn guarded<F: Future>(
    fut: F,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        res = tokio::time::timeout(timeout, fut) => res.map_err(|_| Interrupt::Timeout),
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > PREVIEW_CHARS {
        let head: String = s.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

/// Running state of one streamed answer.
#[derive(Debug, Default)]
pub(crate) struct StreamAssembly {
    full_text: String,
    conversation_id: Option<String>,
    events: usize,
}

impl StreamAssembly {
    /// Apply one event. Answer fragments are appended and passed to `on_chunk` once each.
    pub(crate) fn apply(
        &mut self,
        event: StreamEvent,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send + '_),
    ) -> Result<(), DifyError> {
        self.events += 1;
        match event {
            StreamEvent::Message(ev) | StreamEvent::AgentMessage(ev) => {
                if let Some(answer) = ev.answer.filter(|a| !a.is_empty()) {
                    self.full_text.push_str(&answer);
                    on_chunk(&answer);
                }
                if let Some(id) = ev.conversation_id.filter(|id| !id.is_empty()) {
                    self.conversation_id = Some(id);
                }
            }
            StreamEvent::MessageEnd(ev) => {
                if let Some(id) = ev.conversation_id.filter(|id| !id.is_empty()) {
                    self.conversation_id = Some(id);
                }
            }
            StreamEvent::Error(ev) => {
                return Err(DifyError::Backend {
                    code: ev
                        .code
                        .or_else(|| ev.status.map(|s| s.to_string()))
                        .unwrap_or_else(|| "unknown".to_string()),
                    message: ev.message.unwrap_or_default(),
                });
            }
            StreamEvent::Ping | StreamEvent::Ignored => {}
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> StreamOutcome {
        StreamOutcome {
            full_text: self.full_text,
            conversation_id: self.conversation_id,
        }
    }
}

impl DifyClient {
    pub fn new(settings: AssistantSettings, logger: Logger) -> Self {
        logger.info(
            "DIFY_SERVICE",
            "client initialized",
            Some(&json!({
                "baseUrl": settings.base_url,
                "hasApiKey": settings.has_api_key(),
            })),
        );
        Self {
            settings,
            client: reqwest::Client::new(),
            logger,
        }
    }

    pub fn settings(&self) -> &AssistantSettings {
        &self.settings
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url, path)
    }

    fn require_key(&self) -> Result<&str, DifyError> {
        let check = self.settings.check();
        if !check.is_configured {
            return Err(DifyError::NotConfigured(check.problems.join("\n")));
        }
        self.settings
            .api_key()
            .ok_or_else(|| DifyError::NotConfigured("API key is not configured".to_string()))
    }

    fn message_request<'a>(
        &'a self,
        query: &'a str,
        mode: ResponseMode,
        conversation_id: Option<&'a str>,
    ) -> MessageRequest<'a> {
        MessageRequest {
            query,
            response_mode: mode,
            user: &self.settings.user,
            inputs: InputsBody::from(&self.settings.inputs),
            conversation_id: conversation_id.filter(|id| !id.is_empty()),
            auto_generate_name: true,
        }
    }

    fn fail(&self, request_id: &str, what: &str, err: DifyError) -> DifyError {
        self.logger.error(
            CATEGORY,
            format!("{} failed [{}]", what, request_id),
            Some(&json!({ "kind": err.kind(), "baseUrl": self.settings.base_url })),
            Some(err.error_info()),
        );
        err
    }

    fn interrupted(&self, endpoint: &str, interrupt: Interrupt) -> DifyError {
        match interrupt {
            Interrupt::Timeout => DifyError::Timeout {
                endpoint: endpoint.to_string(),
                after: self.settings.timeout,
            },
            Interrupt::Cancelled => DifyError::Cancelled,
        }
    }

    /// Send a request under the timeout/cancel guard and reject non-2xx statuses.
    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        endpoint: &str,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, DifyError> {
        let timeout = self.settings.timeout;
        let res = match guarded(request.send(), timeout, cancel).await {
            Ok(Ok(res)) => res,
            Ok(Err(e)) => return Err(transport_error(endpoint, e, timeout)),
            Err(i) => return Err(self.interrupted(endpoint, i)),
        };
        if !res.status().is_success() {
            let status = res.status();
            let body = match guarded(res.text(), timeout, cancel).await {
                Ok(Ok(body)) => body,
                _ => String::new(),
            };
            self.logger.warn(
                CATEGORY,
                "backend returned an error status",
                Some(&json!({ "status": status.as_u16(), "body": preview(&body) })),
            );
            return Err(DifyError::Rejected {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
                body,
            });
        }
        Ok(res)
    }

    /// POST /chat-messages in streaming mode. `on_chunk` receives each answer fragment once, in order.
    pub async fn send_streaming_message(
        &self,
        text: &str,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send + '_),
        conversation_id: Option<&str>,
    ) -> Result<StreamOutcome, DifyError> {
        let cancel = CancellationToken::new();
        self.send_streaming_message_with_cancel(text, on_chunk, conversation_id, &cancel)
            .await
    }

    /// Streaming send that also stops when `cancel` fires. Cancellation and timeout abort the same way.
    pub async fn send_streaming_message_with_cancel(
        &self,
        text: &str,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send + '_),
        conversation_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, DifyError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.logger.info(
            CATEGORY,
            format!("streaming message started [{}]", request_id),
            Some(&json!({
                "message": preview(text),
                "conversationId": conversation_id,
                "mode": "streaming",
            })),
        );
        let api_key = self
            .require_key()
            .map_err(|e| self.fail(&request_id, "streaming message", e))?;
        let url = self.endpoint("chat-messages");
        let body = self.message_request(text, ResponseMode::Streaming, conversation_id);
        self.logger.debug(
            CATEGORY,
            format!("sending streaming request [{}]", request_id),
            Some(&json!({ "url": url, "payload": &body })),
        );
        let request = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .json(&body);
        let res = self
            .execute(request, &url, cancel)
            .await
            .map_err(|e| self.fail(&request_id, "streaming message", e))?;

        let timeout = self.settings.timeout;
        let mut stream = res.bytes_stream();
        let mut decoder = FrameDecoder::new();
        let mut assembly = StreamAssembly::default();
        let mut reads = 0usize;
        loop {
            let next = match guarded(stream.next(), timeout, cancel).await {
                Ok(next) => next,
                Err(i) => {
                    let err = self.interrupted(&url, i);
                    return Err(self.fail(&request_id, "streaming message", err));
                }
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| {
                self.fail(&request_id, "streaming message", transport_error(&url, e, timeout))
            })?;
            reads += 1;
            for frame in decoder.push(&chunk) {
                self.apply_frame(&request_id, frame, &mut assembly, on_chunk)?;
            }
        }
        if let Some(frame) = decoder.finish() {
            self.apply_frame(&request_id, frame, &mut assembly, on_chunk)?;
        }

        let events = assembly.events;
        let outcome = assembly.finish();
        self.logger.info(
            CATEGORY,
            format!("streaming message completed [{}]", request_id),
            Some(&json!({
                "reads": reads,
                "events": events,
                "responseLength": outcome.full_text.chars().count(),
                "conversationId": outcome.conversation_id,
            })),
        );
        Ok(outcome)
    }

    fn apply_frame(
        &self,
        request_id: &str,
        frame: Frame,
        assembly: &mut StreamAssembly,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send + '_),
    ) -> Result<(), DifyError> {
        let data = match frame {
            Frame::Data(data) => data,
            Frame::Other(line) => {
                self.logger.warn(
                    CATEGORY,
                    format!("skipping non-data stream line [{}]", request_id),
                    Some(&json!({ "line": preview(&line) })),
                );
                return Ok(());
            }
            Frame::Overflow(dropped) => {
                self.logger.warn(
                    CATEGORY,
                    format!("stream line exceeded the size limit, skipped [{}]", request_id),
                    Some(&json!({ "droppedBytes": dropped })),
                );
                return Ok(());
            }
        };
        let event: StreamEvent = match serde_json::from_str(&data) {
            Ok(ev) => ev,
            Err(e) => {
                self.logger.warn(
                    CATEGORY,
                    format!("skipping unparseable stream frame [{}]", request_id),
                    Some(&json!({ "line": preview(&data), "error": e.to_string() })),
                );
                return Ok(());
            }
        };
        if let StreamEvent::Error(ref ev) = event {
            self.logger.error::<serde_json::Value>(
                CATEGORY,
                format!("stream reported an error [{}]", request_id),
                Some(&json!({ "status": ev.status, "code": ev.code, "message": ev.message })),
                None,
            );
        }
        assembly
            .apply(event, on_chunk)
            .map_err(|e| self.fail(request_id, "streaming message", e))
    }

    /// POST /chat-messages in blocking mode; returns the whole answer at once.
    pub async fn send_message(
        &self,
        text: &str,
        conversation_id: Option<&str>,
    ) -> Result<ChatAnswer, DifyError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.logger.info(
            CATEGORY,
            format!("blocking message started [{}]", request_id),
            Some(&json!({ "message": preview(text), "conversationId": conversation_id, "mode": "blocking" })),
        );
        let api_key = self
            .require_key()
            .map_err(|e| self.fail(&request_id, "blocking message", e))?;
        let url = self.endpoint("chat-messages");
        let body = self.message_request(text, ResponseMode::Blocking, conversation_id);
        let request = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .header(ACCEPT, "application/json")
            .json(&body);
        let cancel = CancellationToken::new();
        let res = self
            .execute(request, &url, &cancel)
            .await
            .map_err(|e| self.fail(&request_id, "blocking message", e))?;
        let answer: ChatAnswer = match guarded(res.json::<ChatAnswer>(), self.settings.timeout, &cancel).await {
            Ok(Ok(a)) => a,
            Ok(Err(e)) => {
                let err = DifyError::InvalidResponse(e.to_string());
                return Err(self.fail(&request_id, "blocking message", err));
            }
            Err(i) => {
                let err = self.interrupted(&url, i);
                return Err(self.fail(&request_id, "blocking message", err));
            }
        };
        self.logger.info(
            CATEGORY,
            format!("blocking message completed [{}]", request_id),
            Some(&json!({
                "messageId": answer.message_id,
                "conversationId": answer.conversation_id,
                "answerLength": answer.answer.chars().count(),
            })),
        );
        Ok(answer)
    }

    /// Reachability of the base URL, then a blocking probe message. 401 means a bad key; 2xx or 400 means connected.
    pub async fn test_connection(&self) -> ConnectionCheck {
        self.logger.info(
            CATEGORY,
            "connection test started",
            Some(&json!({ "baseUrl": self.settings.base_url, "hasApiKey": self.settings.has_api_key() })),
        );
        let api_key = match self.require_key() {
            Ok(k) => k,
            Err(e) => return ConnectionCheck::failed(e.guidance()),
        };
        let cancel = CancellationToken::new();
        let timeout = self.settings.timeout;
        let base = self.settings.base_url.clone();
        match guarded(self.client.get(&base).header(ACCEPT, "application/json").send(), timeout, &cancel).await {
            Ok(Ok(res)) => {
                self.logger.info(
                    CATEGORY,
                    "basic connectivity ok",
                    Some(&json!({ "status": res.status().as_u16() })),
                );
            }
            Ok(Err(e)) => {
                let err = transport_error(&base, e, timeout);
                self.logger.error::<()>(CATEGORY, "basic connectivity failed", None, Some(err.error_info()));
                return ConnectionCheck::failed(err.guidance());
            }
            Err(i) => {
                let err = self.interrupted(&base, i);
                self.logger.error::<()>(CATEGORY, "basic connectivity failed", None, Some(err.error_info()));
                return ConnectionCheck::failed(err.guidance());
            }
        }

        let url = self.endpoint("chat-messages");
        let probe = json!({
            "query": "connection test",
            "response_mode": "blocking",
            "user": self.settings.user,
        });
        let sent = guarded(
            self.client.post(&url).bearer_auth(api_key).json(&probe).send(),
            timeout,
            &cancel,
        )
        .await;
        let res = match sent {
            Ok(Ok(res)) => res,
            Ok(Err(e)) => return ConnectionCheck::failed(transport_error(&url, e, timeout).guidance()),
            Err(i) => return ConnectionCheck::failed(self.interrupted(&url, i).guidance()),
        };
        let status = res.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.logger.error::<()>(CATEGORY, "connection test failed: invalid API key", None, None);
            ConnectionCheck::failed("The API key is invalid (401 Unauthorized).")
        } else if status.is_success() || status == reqwest::StatusCode::BAD_REQUEST {
            self.logger.info::<()>(CATEGORY, "connection test succeeded", None);
            ConnectionCheck::ok()
        } else {
            let body = match guarded(res.text(), timeout, &cancel).await {
                Ok(Ok(body)) => body,
                _ => String::new(),
            };
            self.logger.error::<serde_json::Value>(
                CATEGORY,
                "connection test failed",
                Some(&json!({ "status": status.as_u16(), "body": preview(&body) })),
                None,
            );
            ConnectionCheck::failed(format!("Connection failed: {} - {}", status.as_u16(), body))
        }
    }

    /// GET /conversations for the configured user.
    pub async fn list_conversations(&self, limit: u32) -> Result<ConversationPage, DifyError> {
        let api_key = self.require_key()?;
        let url = self.endpoint("conversations");
        let limit = limit.to_string();
        let request = self
            .client
            .get(&url)
            .bearer_auth(api_key)
            .query(&[("user", self.settings.user.as_str()), ("limit", limit.as_str())]);
        let cancel = CancellationToken::new();
        let res = self.execute(request, &url, &cancel).await?;
        match guarded(res.json::<ConversationPage>(), self.settings.timeout, &cancel).await {
            Ok(Ok(page)) => Ok(page),
            Ok(Err(e)) => Err(DifyError::InvalidResponse(e.to_string())),
            Err(i) => Err(self.interrupted(&url, i)),
        }
    }

    /// DELETE /conversations/{id}.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), DifyError> {
        let api_key = self.require_key()?;
        let url = self.endpoint(&format!("conversations/{}", conversation_id));
        let request = self
            .client
            .delete(&url)
            .bearer_auth(api_key)
            .json(&json!({ "user": self.settings.user }));
        let cancel = CancellationToken::new();
        self.execute(request, &url, &cancel).await?;
        self.logger.info(
            CATEGORY,
            "conversation deleted",
            Some(&json!({ "conversationId": conversation_id })),
        );
        Ok(())
    }
}

fn transport_error(endpoint: &str, e: reqwest::Error, timeout: Duration) -> DifyError {
    if e.is_timeout() {
        DifyError::Timeout {
            endpoint: endpoint.to_string(),
            after: timeout,
        }
    } else {
        DifyError::Network {
            endpoint: endpoint.to_string(),
            source: e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(s: &str) -> StreamEvent {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn decodes_known_and_unknown_event_kinds() {
        assert_eq!(
            event(r#"{"event":"message","answer":"Nike","conversation_id":"c1","task_id":"t"}"#),
            StreamEvent::Message(AnswerEvent {
                answer: Some("Nike".to_string()),
                conversation_id: Some("c1".to_string()),
                message_id: None,
            })
        );
        assert!(matches!(
            event(r#"{"event":"agent_message","answer":"x"}"#),
            StreamEvent::AgentMessage(_)
        ));
        assert_eq!(
            event(r#"{"event":"message_end","conversation_id":"abc123","metadata":{}}"#),
            StreamEvent::MessageEnd(EndEvent {
                conversation_id: Some("abc123".to_string()),
                message_id: None,
            })
        );
        assert_eq!(event(r#"{"event":"ping"}"#), StreamEvent::Ping);
        assert_eq!(
            event(r#"{"event":"agent_thought","thought":"hmm","position":1}"#),
            StreamEvent::Ignored
        );
        assert_eq!(event(r#"{"event":"message_file","url":"u"}"#), StreamEvent::Ignored);
    }

    #[test]
    fn chunks_concatenate_to_full_text() {
        let mut assembly = StreamAssembly::default();
        let mut seen = Vec::new();
        let mut on_chunk = |s: &str| seen.push(s.to_string());
        for raw in [
            r#"{"event":"message","answer":"Nike"}"#,
            r#"{"event":"ping"}"#,
            r#"{"event":"message","answer":""}"#,
            r#"{"event":"agent_message","answer":" Vaporfly","conversation_id":"c0"}"#,
            r#"{"event":"message_end","conversation_id":"abc123"}"#,
        ] {
            assembly.apply(event(raw), &mut on_chunk).unwrap();
        }
        let outcome = assembly.finish();
        assert_eq!(seen, vec!["Nike", " Vaporfly"]);
        assert_eq!(seen.concat(), outcome.full_text);
        assert_eq!(outcome.conversation_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn error_event_becomes_backend_error() {
        let mut assembly = StreamAssembly::default();
        let mut on_chunk = |_: &str| {};
        let err = assembly
            .apply(
                event(r#"{"event":"error","status":400,"code":"invalid_param","message":"bad"}"#),
                &mut on_chunk,
            )
            .unwrap_err();
        match err {
            DifyError::Backend { code, message } => {
                assert_eq!(code, "invalid_param");
                assert_eq!(message, "bad");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn request_body_omits_missing_conversation() {
        let settings = AssistantSettings::new(Some("k".to_string()), "https://example.com/v1");
        let client = DifyClient::new(settings, Logger::default());
        let body = serde_json::to_value(client.message_request("hi", ResponseMode::Streaming, None)).unwrap();
        assert_eq!(
            body,
            json!({
                "query": "hi",
                "response_mode": "streaming",
                "user": "triathlon-user",
                "inputs": { "user_level": "beginner", "budget_range": "medium", "sport_focus": "triathlon" },
                "auto_generate_name": true
            })
        );
        let body = serde_json::to_value(client.message_request("hi", ResponseMode::Blocking, Some("abc"))).unwrap();
        assert_eq!(body["conversation_id"], "abc");
        assert_eq!(body["response_mode"], "blocking");
    }

    #[test]
    fn request_body_carries_caller_user_id() {
        let settings = AssistantSettings::new(Some("k".to_string()), "https://example.com/v1")
            .with_user("shopper-42");
        let client = DifyClient::new(settings, Logger::default());
        let body = serde_json::to_value(client.message_request("hi", ResponseMode::Streaming, None)).unwrap();
        assert_eq!(body["user"], "shopper-42");
    }

    #[test]
    fn guidance_is_actionable() {
        let err = DifyError::Timeout {
            endpoint: "https://example.com/v1/chat-messages".to_string(),
            after: Duration::from_secs(15),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.guidance().contains("diagnostics"));
        let err = DifyError::Rejected {
            status: 401,
            reason: "Unauthorized".to_string(),
            body: "{}".to_string(),
        };
        assert!(err.to_string().contains("401"));
        assert!(err.guidance().contains("API key"));
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let long = "跑".repeat(150);
        let p = preview(&long);
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
        assert!(p.ends_with("..."));
        assert_eq!(preview("short"), "short");
    }
}
