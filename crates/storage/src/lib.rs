use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod http;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use http::RestStorage;
pub use ids::{ConversationId, MessageId, PresetId, UserId};
pub use memory::{MemoryPreferences, MemoryStorage};
pub use sqlite::SqlitePreferences;
pub use types::{
    BackendSetting, ConversationPatch, ConversationRecord, DEFAULT_CONVERSATION_TITLE,
    FormatPreset, FormatPresetPatch, MessagePatch, MessageRecord, MessageRole, NewConversation,
    NewFormatPreset, PresetKind,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ConversationStore: Send + Sync {
    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>>;
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>>;
    fn rename_conversation(
        &self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>>;
    fn delete_conversation(&self, conversation_id: ConversationId)
    -> BoxFuture<'_, StorageResult<()>>;
}

pub trait MessageStore: Send + Sync {
    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;
    /// Replaces a message's content; the service drops every later message.
    fn update_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>>;
    fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<()>>;
}

pub trait SettingsStore: Send + Sync {
    fn list_backend_settings(&self) -> BoxFuture<'_, StorageResult<Vec<BackendSetting>>>;
    fn save_backend_setting(
        &self,
        setting: BackendSetting,
    ) -> BoxFuture<'_, StorageResult<BackendSetting>>;
}

/// Saved format specs, one collection per [`PresetKind`].
pub trait FormatPresetStore: Send + Sync {
    /// Most recently updated first.
    fn list_presets(&self, kind: PresetKind) -> BoxFuture<'_, StorageResult<Vec<FormatPreset>>>;
    fn create_preset(
        &self,
        kind: PresetKind,
        input: NewFormatPreset,
    ) -> BoxFuture<'_, StorageResult<FormatPreset>>;
    fn update_preset(
        &self,
        kind: PresetKind,
        preset_id: PresetId,
        patch: FormatPresetPatch,
    ) -> BoxFuture<'_, StorageResult<FormatPreset>>;
    fn delete_preset(&self, kind: PresetKind, preset_id: PresetId)
    -> BoxFuture<'_, StorageResult<()>>;
}

/// Process-wide key-value state that survives restarts.
pub trait PreferenceStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>>;
    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>>;
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<()>>;
}

pub trait Storage: ConversationStore + MessageStore + SettingsStore + FormatPresetStore {}

impl<T> Storage for T where
    T: ConversationStore + MessageStore + SettingsStore + FormatPresetStore
{
}
