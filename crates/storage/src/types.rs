use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId, PresetId, UserId};

/// Title the storage service gives conversations created without one.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Storage-local message role, intentionally decoupled from session-layer message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub user_id: UserId,
    #[serde(default)]
    pub title: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct NewConversation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationPatch {
    pub title: String,
}

/// Persisted message as returned by the storage service.
///
/// Generation metadata is denormalized onto each row for traceability and is
/// absent on rows written before it existed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub llm_parameters: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub format_spec: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessagePatch {
    pub content: String,
}

/// Connection info saved per backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSetting {
    pub backend: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl BackendSetting {
    pub fn new(
        backend: impl Into<String>,
        base_url: Option<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            base_url: base_url.filter(|value| !value.trim().is_empty()),
            api_key: api_key.filter(|value| !value.trim().is_empty()),
        }
    }
}

/// Family of saved format specs; each has its own collection on the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresetKind {
    Schema,
    Template,
    Regex,
    Csv,
}

impl PresetKind {
    pub const ALL: [PresetKind; 4] = [
        PresetKind::Schema,
        PresetKind::Template,
        PresetKind::Regex,
        PresetKind::Csv,
    ];

    pub fn path(self) -> &'static str {
        match self {
            PresetKind::Schema => "/formats/schemas",
            PresetKind::Template => "/formats/templates",
            PresetKind::Regex => "/formats/regex",
            PresetKind::Csv => "/formats/csv",
        }
    }

    /// Wire name of the field holding the spec text.
    pub fn body_field(self) -> &'static str {
        match self {
            PresetKind::Schema => "schema_content",
            PresetKind::Template => "content",
            PresetKind::Regex => "pattern",
            PresetKind::Csv => "columns",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PresetKind::Schema => "schema",
            PresetKind::Template => "template",
            PresetKind::Regex => "regex",
            PresetKind::Csv => "csv",
        }
    }
}

/// Named, saved format spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatPreset {
    pub id: PresetId,
    pub name: String,
    #[serde(alias = "schema_content", alias = "content", alias = "pattern", alias = "columns")]
    pub body: String,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFormatPreset {
    pub name: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FormatPresetPatch {
    pub name: Option<String>,
    pub body: Option<String>,
}

impl NewFormatPreset {
    /// Request body keyed the way the collection of `kind` expects.
    pub fn to_wire(&self, kind: PresetKind) -> serde_json::Map<String, serde_json::Value> {
        let mut body = serde_json::Map::new();
        body.insert("name".to_string(), self.name.clone().into());
        body.insert(kind.body_field().to_string(), self.body.clone().into());
        body
    }
}

impl FormatPresetPatch {
    pub fn to_wire(&self, kind: PresetKind) -> serde_json::Map<String, serde_json::Value> {
        let mut body = serde_json::Map::new();
        if let Some(name) = &self.name {
            body.insert("name".to_string(), name.clone().into());
        }
        if let Some(spec) = &self.body {
            body.insert(kind.body_field().to_string(), spec.clone().into());
        }
        body
    }
}
