//! Assistant backend client (Dify chat-app API) and the event-stream decoder it uses.
//!
//! [`AssistantBackend`] is the seam the chat session drives; [`DifyClient`] implements it.

mod dify;
pub mod sse;

pub use dify::{
    AnswerEvent, ChatAnswer, ConnectionCheck, ConversationPage, ConversationSummary, DifyClient,
    DifyError, EndEvent, ErrorEvent, ErrorKind, ResponseMode, StreamEvent, StreamOutcome,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::AssistantSettings;

/// Backend that can stream one chat turn.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    fn settings(&self) -> &AssistantSettings;

    /// Stream one turn. `on_chunk` gets each answer fragment; `cancel` stops the request.
    async fn stream_turn(
        &self,
        text: &str,
        conversation_id: Option<&str>,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send + '_),
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, DifyError>;

    async fn check_connection(&self) -> ConnectionCheck;
}

#[async_trait]
impl AssistantBackend for DifyClient {
    fn settings(&self) -> &AssistantSettings {
        DifyClient::settings(self)
    }

    async fn stream_turn(
        &self,
        text: &str,
        conversation_id: Option<&str>,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send + '_),
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, DifyError> {
        self.send_streaming_message_with_cancel(text, on_chunk, conversation_id, cancel)
            .await
    }

    async fn check_connection(&self) -> ConnectionCheck {
        self.test_connection().await
    }
}
