//! Boundary to the chat client that owns conversations.

use crate::error::Result;
use crate::pipeline::messages::VoiceMessage;
use async_trait::async_trait;

/// Receives transcribed utterances and answers with the assistant's reply.
#[async_trait]
pub trait ChatCollaborator: Send + Sync + 'static {
    /// Post `message` to the current conversation.
    ///
    /// Returns the assistant's reply text, or `None` when the reply is
    /// delivered some other way.
    ///
    /// # Errors
    ///
    /// Any error is surfaced to the user as-is.
    async fn send_message(&self, message: VoiceMessage) -> Result<Option<String>>;
}
