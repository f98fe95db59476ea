use std::collections::HashMap;

use chrono::{NaiveDateTime, Utc};
use tokio::sync::RwLock;

use super::error::{NotFoundSnafu, StorageResult};
use super::ids::{ConversationId, MessageId, PresetId, UserId};
use super::types::{
    BackendSetting, ConversationPatch, ConversationRecord, DEFAULT_CONVERSATION_TITLE,
    FormatPreset, FormatPresetPatch, MessagePatch, MessageRecord, MessageRole, NewConversation,
    NewFormatPreset, PresetKind,
};
use super::{
    BoxFuture, ConversationStore, FormatPresetStore, MessageStore, PreferenceStore,
    SettingsStore,
};

#[derive(Debug, Default)]
struct MemoryState {
    conversations: Vec<ConversationRecord>,
    messages: Vec<MessageRecord>,
    settings: Vec<BackendSetting>,
    presets: HashMap<PresetKind, Vec<FormatPreset>>,
    last_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

/// In-process stand-in for the REST storage service.
#[derive(Debug)]
pub struct MemoryStorage {
    owner: UserId,
    state: RwLock<MemoryState>,
}

impl MemoryStorage {
    pub fn new(owner: UserId) -> Self {
        Self {
            owner,
            state: RwLock::new(MemoryState::default()),
        }
    }

    /// Appends a persisted message directly, bypassing generation.
    pub async fn insert_message(
        &self,
        conversation_id: ConversationId,
        role: MessageRole,
        content: impl Into<String>,
    ) -> MessageRecord {
        let mut state = self.state.write().await;
        let id = MessageId::new(state.next_id());
        let record = MessageRecord {
            id,
            conversation_id,
            role,
            content: content.into(),
            created_at: now(),
            backend: None,
            model: None,
            output_format: None,
            llm_parameters: None,
            format_spec: None,
        };
        state.messages.push(record.clone());
        record
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

impl ConversationStore for MemoryStorage {
    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut conversations = state.conversations.clone();
            conversations.sort_by(|left, right| {
                right
                    .updated_at
                    .cmp(&left.updated_at)
                    .then_with(|| right.id.cmp(&left.id))
            });
            Ok(conversations)
        })
    }

    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let title = input
                .title
                .filter(|title| !title.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CONVERSATION_TITLE.to_string());
            let created_at = now();
            let record = ConversationRecord {
                id: ConversationId::new(state.next_id()),
                user_id: self.owner,
                title,
                created_at,
                updated_at: created_at,
            };
            state.conversations.push(record.clone());
            Ok(record)
        })
    }

    fn rename_conversation(
        &self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let Some(record) = state
                .conversations
                .iter_mut()
                .find(|record| record.id == conversation_id)
            else {
                return NotFoundSnafu {
                    stage: "memory-rename-conversation",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            };

            record.title = patch.title;
            record.updated_at = now();
            Ok(record.clone())
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let before = state.conversations.len();
            state
                .conversations
                .retain(|record| record.id != conversation_id);
            if state.conversations.len() == before {
                return NotFoundSnafu {
                    stage: "memory-delete-conversation",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            state
                .messages
                .retain(|message| message.conversation_id != conversation_id);
            Ok(())
        })
    }
}

impl MessageStore for MemoryStorage {
    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut messages = state
                .messages
                .iter()
                .filter(|message| message.conversation_id == conversation_id)
                .cloned()
                .collect::<Vec<_>>();
            messages.sort_by(|left, right| {
                left.created_at
                    .cmp(&right.created_at)
                    .then_with(|| left.id.cmp(&right.id))
            });
            Ok(messages)
        })
    }

    fn update_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let Some(position) = state.messages.iter().position(|message| {
                message.conversation_id == conversation_id && message.id == message_id
            }) else {
                return NotFoundSnafu {
                    stage: "memory-update-message",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            };

            state.messages[position].content = patch.content;
            let edited = state.messages[position].clone();

            // Editing rewinds the conversation to the edited message.
            state.messages.retain(|message| {
                message.conversation_id != conversation_id
                    || (message.created_at, message.id) <= (edited.created_at, edited.id)
            });
            Ok(edited)
        })
    }

    fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let before = state.messages.len();
            state.messages.retain(|message| {
                message.conversation_id != conversation_id || message.id != message_id
            });
            if state.messages.len() == before {
                return NotFoundSnafu {
                    stage: "memory-delete-message",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            }
            Ok(())
        })
    }
}

impl SettingsStore for MemoryStorage {
    fn list_backend_settings(&self) -> BoxFuture<'_, StorageResult<Vec<BackendSetting>>> {
        Box::pin(async move { Ok(self.state.read().await.settings.clone()) })
    }

    fn save_backend_setting(
        &self,
        setting: BackendSetting,
    ) -> BoxFuture<'_, StorageResult<BackendSetting>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            match state
                .settings
                .iter_mut()
                .find(|existing| existing.backend == setting.backend)
            {
                Some(existing) => *existing = setting.clone(),
                None => state.settings.push(setting.clone()),
            }
            Ok(setting)
        })
    }
}

impl FormatPresetStore for MemoryStorage {
    fn list_presets(&self, kind: PresetKind) -> BoxFuture<'_, StorageResult<Vec<FormatPreset>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut presets = state.presets.get(&kind).cloned().unwrap_or_default();
            presets.sort_by(|left, right| {
                right
                    .updated_at
                    .cmp(&left.updated_at)
                    .then_with(|| right.id.cmp(&left.id))
            });
            Ok(presets)
        })
    }

    fn create_preset(
        &self,
        kind: PresetKind,
        input: NewFormatPreset,
    ) -> BoxFuture<'_, StorageResult<FormatPreset>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let created_at = now();
            let preset = FormatPreset {
                id: PresetId::new(state.next_id()),
                name: input.name,
                body: input.body,
                created_at: Some(created_at),
                updated_at: Some(created_at),
            };
            state.presets.entry(kind).or_default().push(preset.clone());
            Ok(preset)
        })
    }

    fn update_preset(
        &self,
        kind: PresetKind,
        preset_id: PresetId,
        patch: FormatPresetPatch,
    ) -> BoxFuture<'_, StorageResult<FormatPreset>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let Some(preset) = state
                .presets
                .get_mut(&kind)
                .and_then(|presets| presets.iter_mut().find(|preset| preset.id == preset_id))
            else {
                return NotFoundSnafu {
                    stage: "memory-update-preset",
                    entity: "preset",
                    id: preset_id.to_string(),
                }
                .fail();
            };

            if let Some(name) = patch.name {
                preset.name = name;
            }
            if let Some(body) = patch.body {
                preset.body = body;
            }
            preset.updated_at = Some(now());
            Ok(preset.clone())
        })
    }

    fn delete_preset(
        &self,
        kind: PresetKind,
        preset_id: PresetId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let presets = state.presets.entry(kind).or_default();
            let before = presets.len();
            presets.retain(|preset| preset.id != preset_id);
            if presets.len() == before {
                return NotFoundSnafu {
                    stage: "memory-delete-preset",
                    entity: "preset",
                    id: preset_id.to_string(),
                }
                .fail();
            }
            Ok(())
        })
    }
}

/// Volatile preference store used in tests and when no database path is configured.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move { Ok(self.entries.read().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            self.entries.write().await.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            self.entries.write().await.remove(key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_message_discards_later_messages() {
        let storage = MemoryStorage::new(UserId::new(1));
        let conversation = storage
            .create_conversation(NewConversation::default())
            .await
            .unwrap();
        let first = storage
            .insert_message(conversation.id, MessageRole::User, "one")
            .await;
        storage
            .insert_message(conversation.id, MessageRole::Assistant, "two")
            .await;
        storage
            .insert_message(conversation.id, MessageRole::User, "three")
            .await;

        let edited = storage
            .update_message(
                conversation.id,
                first.id,
                MessagePatch {
                    content: "uno".to_string(),
                },
            )
            .await
            .unwrap();

        let remaining = storage.list_messages(conversation.id).await.unwrap();
        assert_eq!(edited.content, "uno");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, first.id);
    }

    #[tokio::test]
    async fn deleting_missing_message_reports_not_found() {
        let storage = MemoryStorage::new(UserId::new(1));
        let error = storage
            .delete_message(ConversationId::new(1), MessageId::new(99))
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn save_backend_setting_upserts_by_backend() {
        let storage = MemoryStorage::new(UserId::new(1));
        storage
            .save_backend_setting(BackendSetting::new("vllm", Some("http://a".into()), None))
            .await
            .unwrap();
        storage
            .save_backend_setting(BackendSetting::new("vllm", Some("http://b".into()), None))
            .await
            .unwrap();

        let settings = storage.list_backend_settings().await.unwrap();
        assert_eq!(settings.len(), 1);
        assert_eq!(settings[0].base_url.as_deref(), Some("http://b"));
    }

    #[tokio::test]
    async fn presets_are_kept_per_kind_newest_first() {
        let storage = MemoryStorage::new(UserId::new(1));
        let older = storage
            .create_preset(
                PresetKind::Regex,
                NewFormatPreset {
                    name: "digits".to_string(),
                    body: "\\d+".to_string(),
                },
            )
            .await
            .unwrap();
        let newer = storage
            .create_preset(
                PresetKind::Regex,
                NewFormatPreset {
                    name: "words".to_string(),
                    body: "\\w+".to_string(),
                },
            )
            .await
            .unwrap();
        storage
            .update_preset(
                PresetKind::Regex,
                older.id,
                FormatPresetPatch {
                    name: Some("numbers".to_string()),
                    body: None,
                },
            )
            .await
            .unwrap();

        let regex = storage.list_presets(PresetKind::Regex).await.unwrap();
        assert_eq!(regex.len(), 2);
        assert_eq!(regex[0].id, older.id);
        assert_eq!(regex[0].name, "numbers");
        assert_eq!(regex[0].body, "\\d+");
        assert_eq!(regex[1].id, newer.id);
        assert!(storage.list_presets(PresetKind::Csv).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn preset_of_another_kind_is_not_found() {
        let storage = MemoryStorage::new(UserId::new(1));
        let preset = storage
            .create_preset(
                PresetKind::Template,
                NewFormatPreset {
                    name: "card".to_string(),
                    body: "Name: [GEN]".to_string(),
                },
            )
            .await
            .unwrap();

        let error = storage
            .delete_preset(PresetKind::Schema, preset.id)
            .await
            .unwrap_err();
        assert!(error.is_not_found());
        storage
            .delete_preset(PresetKind::Template, preset.id)
            .await
            .unwrap();
        assert!(storage.list_presets(PresetKind::Template).await.unwrap().is_empty());
    }
}
