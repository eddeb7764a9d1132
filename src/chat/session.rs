//! Conversation identity and per-session settings

use crate::connection::connection_url;
use crate::protocol::ClientFrame;

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Assigned by the server on the first exchange of a new conversation
    pub conversation_id: Option<String>,
    pub project_id: Option<String>,
    pub provider: String,
    pub role: String,
    pub turbo_mode: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            conversation_id: None,
            project_id: None,
            provider: "anthropic".to_string(),
            role: "user".to_string(),
            turbo_mode: false,
        }
    }
}

impl Session {
    pub fn url(&self, base: &str) -> String {
        connection_url(
            base,
            self.conversation_id.as_deref(),
            self.project_id.as_deref(),
        )
    }

    /// Adopt a server-assigned conversation id. Returns true when it changed.
    pub fn assign_conversation(&mut self, conversation_id: &str) -> bool {
        if conversation_id.is_empty() || self.conversation_id.as_deref() == Some(conversation_id) {
            return false;
        }
        self.conversation_id = Some(conversation_id.to_string());
        true
    }

    /// Start a new conversation; the server assigns the id on first send.
    pub fn reset_conversation(&mut self) {
        self.conversation_id = None;
    }

    pub fn message_frame(&self, text: &str) -> ClientFrame {
        ClientFrame::Message {
            message: text.to_string(),
            conversation_id: self.conversation_id.clone(),
            project_id: self.project_id.clone(),
            provider: self.provider.clone(),
            user_role: self.role.clone(),
            turbo_mode: self.turbo_mode,
        }
    }

    pub fn stop_frame(&self) -> ClientFrame {
        ClientFrame::StopGeneration {
            conversation_id: self.conversation_id.clone(),
            project_id: self.project_id.clone(),
        }
    }

    pub fn sync_frame(&self) -> ClientFrame {
        ClientFrame::SyncState {
            conversation_id: self.conversation_id.clone(),
        }
    }
}
