//! Persistence of finished conversations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::voice::store::Message;

/// Receives the message log of a conversation the user ended.
#[async_trait]
pub trait ConversationArchive: Send + Sync {
    async fn save(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ArchivedConversation {
    pub session_id: String,
    pub saved_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

/// Writes one pretty-printed JSON file per conversation.
#[derive(Debug, Clone)]
pub struct JsonArchive {
    dir: PathBuf,
}

impl JsonArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ConversationArchive for JsonArchive {
    async fn save(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()> {
        if messages.is_empty() {
            tracing::debug!(session_id, "Nothing to archive");
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.dir).await?;

        let record = ArchivedConversation {
            session_id: session_id.to_string(),
            saved_at: Utc::now(),
            messages: messages.to_vec(),
        };
        let path = self.path_for(session_id);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&record)?).await?;
        tracing::info!(
            session_id,
            messages = messages.len(),
            path = %path.display(),
            "Conversation archived"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::events::{PlainText, Role};

    fn message(role: Role, text: &str) -> Message {
        Message {
            role,
            content: PlainText::sanitize(text),
            timestamp: Utc::now(),
            audio: None,
        }
    }

    #[tokio::test]
    async fn saves_conversation_as_json() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = JsonArchive::new(tmp.path().join("conversations"));
        let messages = vec![
            message(Role::User, "¿Dónde está la estación?"),
            message(Role::Assistant, "Está a la izquierda."),
        ];

        archive.save("abc-123", &messages).await.unwrap();

        let raw = std::fs::read_to_string(archive.path_for("abc-123")).unwrap();
        let saved: ArchivedConversation = serde_json::from_str(&raw).unwrap();
        assert_eq!(saved.session_id, "abc-123");
        assert_eq!(saved.messages, messages);
        assert!(raw.contains("\"role\": \"assistant\""));
    }

    #[tokio::test]
    async fn empty_log_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = JsonArchive::new(tmp.path());
        archive.save("empty", &[]).await.unwrap();
        assert!(!archive.path_for("empty").exists());
    }

    #[test]
    fn session_id_cannot_escape_directory() {
        let archive = JsonArchive::new("/data");
        assert_eq!(
            archive.path_for("../../etc/passwd"),
            PathBuf::from("/data/______etc_passwd.json")
        );
    }
}
