use serde_json::{Map, Value};
use structura_llm::StreamOutcome;
use structura_storage::{
    BackendSetting, ConversationId, ConversationRecord, FormatPreset, MessageId, MessageRole,
};

use super::message::{Message, MessageKey, Phase};
use crate::format::FormatState;
use crate::preferences::PromptHistory;
use crate::registry::ModelSelection;

/// Immutable view of a session. Every change publishes a new snapshot.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub conversations: Vec<ConversationRecord>,
    pub conversation_id: Option<ConversationId>,
    pub messages: Vec<Message>,
    /// Assistant message of the latest generation, followed through re-keying.
    pub reply: Option<MessageKey>,
    pub phase: Phase,
    pub prompt: String,
    pub selection: ModelSelection,
    pub format: FormatState,
    /// Saved specs of the active format, as last loaded.
    pub presets: Vec<FormatPreset>,
    /// Free-form generation parameters such as temperature.
    pub parameters: Map<String, Value>,
    pub backend_settings: Vec<BackendSetting>,
    pub history: PromptHistory,
    /// User-facing notice left by the last failure.
    pub notice: Option<String>,
    pub last_outcome: Option<StreamOutcome>,
}

impl SessionSnapshot {
    pub fn is_loading(&self) -> bool {
        self.phase.is_active()
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.phase, Phase::Streaming(_))
    }

    /// Whether a send would pass validation right now.
    pub fn can_send(&self) -> bool {
        !self.is_loading() && self.selection.is_connected() && self.selection.model().is_some()
    }

    pub fn current_conversation(&self) -> Option<&ConversationRecord> {
        let id = self.conversation_id?;
        self.conversations.iter().find(|record| record.id == id)
    }

    pub fn message(&self, message_id: MessageId) -> Option<&Message> {
        self.messages
            .iter()
            .find(|message| message.id() == Some(message_id))
    }

    pub fn reply(&self) -> Option<&Message> {
        let key = self.reply?;
        self.messages.iter().find(|message| message.key == key)
    }

    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::Assistant)
    }
}
