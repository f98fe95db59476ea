use std::fmt;

use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use structura_llm::{Backend, OutputFormat};
use structura_storage::{MessageId, MessageRecord, MessageRole};
use uuid::Uuid;

use crate::format;

/// Client-side identity of a message the storage service has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalMessageId(Uuid);

impl LocalMessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LocalMessageId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Pending(LocalMessageId),
    Persisted(MessageId),
}

impl MessageKey {
    pub fn pending() -> Self {
        Self::Pending(LocalMessageId::new())
    }

    pub fn persisted_id(&self) -> Option<MessageId> {
        match self {
            Self::Persisted(id) => Some(*id),
            Self::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persisted(id) => write!(formatter, "#{id}"),
            Self::Pending(_) => formatter.write_str("pending"),
        }
    }
}

/// Generation settings a message was produced under.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageMeta {
    pub backend: Option<Backend>,
    pub model: Option<String>,
    pub output_format: Option<OutputFormat>,
    pub format_spec: Option<String>,
    pub parameters: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub key: MessageKey,
    pub role: MessageRole,
    pub content: String,
    pub meta: MessageMeta,
    pub created_at: Option<NaiveDateTime>,
}

impl Message {
    /// Optimistic entry shown before the storage service assigns an id.
    pub fn pending(role: MessageRole, content: impl Into<String>, meta: MessageMeta) -> Self {
        Self {
            key: MessageKey::pending(),
            role,
            content: content.into(),
            meta,
            created_at: None,
        }
    }

    pub fn from_record(record: MessageRecord) -> Self {
        let meta = MessageMeta {
            backend: record.backend.as_deref().and_then(|raw| raw.parse().ok()),
            model: record.model,
            output_format: record
                .output_format
                .as_deref()
                .and_then(|raw| raw.parse().ok()),
            format_spec: record.format_spec,
            parameters: record.llm_parameters,
        };

        Self {
            key: MessageKey::Persisted(record.id),
            role: record.role,
            content: record.content,
            meta,
            created_at: Some(record.created_at),
        }
    }

    pub fn id(&self) -> Option<MessageId> {
        self.key.persisted_id()
    }

    /// What the user authored, without any appended format instruction.
    pub fn display_text(&self) -> &str {
        format::display_text(&self.content)
    }
}

/// Identifies one send cycle so late events from an older one are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenerationId(pub u64);

impl fmt::Display for GenerationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Send/stream lifecycle of a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Composing,
    Sending(GenerationId),
    Streaming(GenerationId),
    Completed(GenerationId),
    Cancelled(GenerationId),
    Failed {
        generation: GenerationId,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseTransition {
    Compose,
    ClearDraft,
    Begin(GenerationId),
    Open(GenerationId),
    Complete(GenerationId),
    Cancel(GenerationId),
    Fail {
        generation: GenerationId,
        reason: String,
    },
    /// Settles the finished phase of a generation back to idle.
    ResetToIdle(GenerationId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseRejection {
    Busy {
        active: GenerationId,
        attempted: GenerationId,
    },
    NoActiveGeneration,
    NotFinished(GenerationId),
    GenerationMismatch {
        active: GenerationId,
        attempted: GenerationId,
    },
}

pub type PhaseResult = Result<Phase, PhaseRejection>;

impl Phase {
    /// The generation currently sending or streaming, if any.
    pub fn active_generation(&self) -> Option<GenerationId> {
        match self {
            Self::Sending(generation) | Self::Streaming(generation) => Some(*generation),
            Self::Idle
            | Self::Composing
            | Self::Completed(_)
            | Self::Cancelled(_)
            | Self::Failed { .. } => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_generation().is_some()
    }

    pub fn accepts(&self, generation: GenerationId) -> bool {
        self.active_generation() == Some(generation)
    }

    /// Applies one transition.
    ///
    /// Only one generation may be active. Terminal transitions must name the
    /// active generation exactly.
    pub fn apply(&self, transition: PhaseTransition) -> PhaseResult {
        match transition {
            PhaseTransition::Compose => Ok(match self {
                Self::Sending(_) | Self::Streaming(_) => self.clone(),
                _ => Self::Composing,
            }),
            PhaseTransition::ClearDraft => Ok(match self {
                Self::Composing => Self::Idle,
                _ => self.clone(),
            }),
            PhaseTransition::Begin(generation) => match self.active_generation() {
                Some(active) => Err(PhaseRejection::Busy {
                    active,
                    attempted: generation,
                }),
                None => Ok(Self::Sending(generation)),
            },
            PhaseTransition::Open(generation) => match self {
                Self::Sending(active) | Self::Streaming(active) if *active == generation => {
                    Ok(Self::Streaming(generation))
                }
                _ => self.finish(generation, Self::Streaming(generation)),
            },
            PhaseTransition::Complete(generation) => {
                self.finish(generation, Self::Completed(generation))
            }
            PhaseTransition::Cancel(generation) => {
                self.finish(generation, Self::Cancelled(generation))
            }
            PhaseTransition::Fail { generation, reason } => {
                self.finish(generation, Self::Failed { generation, reason })
            }
            PhaseTransition::ResetToIdle(generation) => match self {
                Self::Completed(finished)
                | Self::Cancelled(finished)
                | Self::Failed {
                    generation: finished,
                    ..
                } if *finished == generation => Ok(Self::Idle),
                _ => match self.active_generation() {
                    Some(active) => Err(PhaseRejection::GenerationMismatch {
                        active,
                        attempted: generation,
                    }),
                    None => Err(PhaseRejection::NotFinished(generation)),
                },
            },
        }
    }

    fn finish(&self, generation: GenerationId, next: Phase) -> PhaseResult {
        match self.active_generation() {
            Some(active) if active == generation => Ok(next),
            Some(active) => Err(PhaseRejection::GenerationMismatch {
                active,
                attempted: generation,
            }),
            None => Err(PhaseRejection::NoActiveGeneration),
        }
    }
}
