use tracing::info;

use crate::backend::Backend;
use crate::error::{ClientError, Result};
use crate::wire::ChatReply;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub role: Role,
    pub text: String,
}

/// Open conversation with the assistant. The session id lives as long as
/// this value does.
#[derive(Debug, Clone)]
pub struct ChatSession {
    session_id: String,
    transcript: Vec<ChatLine>,
}

impl ChatSession {
    pub async fn start(backend: &dyn Backend) -> Result<Self> {
        let start = backend.start_chat().await?;
        info!(session_id = %start.session_id, "chat session started");

        let mut transcript = Vec::new();
        if let Some(welcome) = start.welcome_message.filter(|text| !text.trim().is_empty()) {
            transcript.push(ChatLine {
                role: Role::Assistant,
                text: welcome,
            });
        }
        Ok(Self {
            session_id: start.session_id,
            transcript,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn transcript(&self) -> &[ChatLine] {
        &self.transcript
    }

    /// Records the user's line, then the assistant's reply once it arrives.
    /// Blank messages are rejected without contacting the backend.
    pub async fn send(&mut self, backend: &dyn Backend, message: &str) -> Result<ChatReply> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        self.transcript.push(ChatLine {
            role: Role::User,
            text: message.to_string(),
        });

        let reply = backend.send_message(&self.session_id, message).await?;
        self.transcript.push(ChatLine {
            role: Role::Assistant,
            text: reply.response.clone(),
        });
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ClientError;
    use crate::testing::FakeBackend;
    use crate::wire::{ChatReply, ModelPayload};

    use super::{ChatSession, Role};

    #[tokio::test]
    async fn transcript_records_both_sides() {
        let backend = FakeBackend::new();
        backend.push_chat_reply(Ok(ChatReply {
            response: "What radius?".to_string(),
            model: ModelPayload::default(),
        }));

        let mut session = ChatSession::start(&backend).await.expect("session starts");
        assert_eq!(session.session_id(), "s1");
        let reply = session
            .send(&backend, "  make a sphere ")
            .await
            .expect("reply arrives");
        assert_eq!(reply.response, "What radius?");

        let roles = session
            .transcript()
            .iter()
            .map(|line| line.role)
            .collect::<Vec<_>>();
        assert_eq!(roles, vec![Role::Assistant, Role::User, Role::Assistant]);
        assert_eq!(session.transcript()[1].text, "make a sphere");
    }

    #[tokio::test]
    async fn blank_message_is_not_sent() {
        let backend = FakeBackend::new();
        let mut session = ChatSession::start(&backend).await.expect("session starts");
        let err = session.send(&backend, "   ").await.expect_err("blank");
        assert!(matches!(err, ClientError::EmptyMessage));
        assert_eq!(backend.calls(), vec!["start_chat".to_string()]);
    }

    #[tokio::test]
    async fn failed_send_keeps_user_line() {
        let backend = FakeBackend::new();
        let mut session = ChatSession::start(&backend).await.expect("session starts");
        assert!(session.send(&backend, "hello").await.is_err());
        assert_eq!(session.transcript().len(), 2);
    }
}
