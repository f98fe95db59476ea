#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use futures::channel::mpsc;
use structura_core::{ChatSession, SessionOptions, SessionServices};
use structura_llm::{
    ApiError, ApiResult, Backend, ByteStream, CapabilityMap, ConnectionParams, GenerationRequest,
    LlmService, Model,
};
use structura_storage::{
    BackendSetting, BoxFuture, ConversationId, ConversationPatch, ConversationRecord,
    ConversationStore, FormatPreset, FormatPresetPatch, FormatPresetStore, MemoryPreferences,
    MemoryStorage, MessageId, MessagePatch, MessageRecord, MessageStore, NewConversation,
    NewFormatPreset, PresetId, PresetKind, SettingsStore, StorageResult, UserId,
};
use tokio::sync::oneshot;

pub enum ScriptedStream {
    Chunks(Vec<Vec<u8>>),
    Channel(mpsc::UnboundedReceiver<ApiResult<Vec<u8>>>),
    Reject(u16),
}

struct Gate {
    entered: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

impl Gate {
    fn open() -> (Self, oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let gate = Gate {
            entered: entered_tx,
            release: release_rx,
        };
        (gate, entered_rx, release_tx)
    }

    async fn pass(self) {
        let _ = self.entered.send(());
        let _ = self.release.await;
    }
}

/// Scripted chat service: fixed capabilities and models, queued generation bodies.
#[derive(Default)]
pub struct FakeLlm {
    capabilities: HashMap<String, Vec<String>>,
    models: HashMap<Backend, Vec<String>>,
    gates: Mutex<HashMap<Backend, Gate>>,
    streams: Mutex<VecDeque<ScriptedStream>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl FakeLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(mut self, backend: Backend, formats: &[&str]) -> Self {
        self.capabilities.insert(
            backend.as_str().to_string(),
            formats.iter().map(|format| format.to_string()).collect(),
        );
        self
    }

    pub fn with_models(mut self, backend: Backend, models: &[&str]) -> Self {
        self.models.insert(
            backend,
            models.iter().map(|model| model.to_string()).collect(),
        );
        self
    }

    pub fn push_stream(&self, stream: ScriptedStream) {
        self.streams.lock().unwrap().push_back(stream);
    }

    /// Holds the next model listing for `backend` until `release` fires.
    pub fn gate(&self, backend: Backend) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (gate, entered_rx, release_tx) = Gate::open();
        self.gates.lock().unwrap().insert(backend, gate);
        (entered_rx, release_tx)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl LlmService for FakeLlm {
    fn capabilities(&self) -> BoxFuture<'_, ApiResult<CapabilityMap>> {
        Box::pin(async move { Ok(CapabilityMap::from_wire(self.capabilities.clone())) })
    }

    fn list_models<'a>(
        &'a self,
        backend: Backend,
        _connection: &'a ConnectionParams,
    ) -> BoxFuture<'a, ApiResult<Vec<Model>>> {
        Box::pin(async move {
            let gate = self.gates.lock().unwrap().remove(&backend);
            if let Some(gate) = gate {
                gate.pass().await;
            }
            Ok(self
                .models
                .get(&backend)
                .into_iter()
                .flatten()
                .map(Model::from_id)
                .collect())
        })
    }

    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, ApiResult<ByteStream>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            let script = self.streams.lock().unwrap().pop_front();
            match script {
                Some(ScriptedStream::Chunks(chunks)) => {
                    Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
                }
                Some(ScriptedStream::Channel(receiver)) => Ok(receiver.boxed()),
                Some(ScriptedStream::Reject(status)) => Err(ApiError::HttpStatus {
                    stage: "fake-generate",
                    status,
                    body: "rejected".to_string(),
                }),
                None => Ok(futures::stream::empty().boxed()),
            }
        })
    }
}

/// Memory storage whose next settings listing can be held open.
pub struct GatedStorage {
    inner: Arc<MemoryStorage>,
    settings_gate: Mutex<Option<Gate>>,
}

impl GatedStorage {
    pub fn new(inner: Arc<MemoryStorage>) -> Self {
        Self {
            inner,
            settings_gate: Mutex::new(None),
        }
    }

    /// Holds the next backend settings listing until `release` fires.
    pub fn gate_settings(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (gate, entered_rx, release_tx) = Gate::open();
        *self.settings_gate.lock().unwrap() = Some(gate);
        (entered_rx, release_tx)
    }
}

impl ConversationStore for GatedStorage {
    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        self.inner.list_conversations()
    }

    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        self.inner.create_conversation(input)
    }

    fn rename_conversation(
        &self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        self.inner.rename_conversation(conversation_id, patch)
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        self.inner.delete_conversation(conversation_id)
    }
}

impl MessageStore for GatedStorage {
    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        self.inner.list_messages(conversation_id)
    }

    fn update_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        self.inner.update_message(conversation_id, message_id, patch)
    }

    fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        self.inner.delete_message(conversation_id, message_id)
    }
}

impl SettingsStore for GatedStorage {
    fn list_backend_settings(&self) -> BoxFuture<'_, StorageResult<Vec<BackendSetting>>> {
        Box::pin(async move {
            let gate = self.settings_gate.lock().unwrap().take();
            if let Some(gate) = gate {
                gate.pass().await;
            }
            self.inner.list_backend_settings().await
        })
    }

    fn save_backend_setting(
        &self,
        setting: BackendSetting,
    ) -> BoxFuture<'_, StorageResult<BackendSetting>> {
        self.inner.save_backend_setting(setting)
    }
}

impl FormatPresetStore for GatedStorage {
    fn list_presets(&self, kind: PresetKind) -> BoxFuture<'_, StorageResult<Vec<FormatPreset>>> {
        self.inner.list_presets(kind)
    }

    fn create_preset(
        &self,
        kind: PresetKind,
        input: NewFormatPreset,
    ) -> BoxFuture<'_, StorageResult<FormatPreset>> {
        self.inner.create_preset(kind, input)
    }

    fn update_preset(
        &self,
        kind: PresetKind,
        preset_id: PresetId,
        patch: FormatPresetPatch,
    ) -> BoxFuture<'_, StorageResult<FormatPreset>> {
        self.inner.update_preset(kind, preset_id, patch)
    }

    fn delete_preset(
        &self,
        kind: PresetKind,
        preset_id: PresetId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        self.inner.delete_preset(kind, preset_id)
    }
}

pub struct Harness {
    pub session: Arc<ChatSession>,
    pub llm: Arc<FakeLlm>,
    pub storage: Arc<MemoryStorage>,
    /// The storage the session talks to, wrapping `storage`.
    pub gated: Arc<GatedStorage>,
    pub preferences: Arc<MemoryPreferences>,
}

pub fn harness(llm: FakeLlm) -> Harness {
    let llm = Arc::new(llm);
    let storage = Arc::new(MemoryStorage::new(UserId::new(1)));
    let gated = Arc::new(GatedStorage::new(storage.clone()));
    let preferences = Arc::new(MemoryPreferences::new());
    let session = Arc::new(ChatSession::new(
        SessionServices {
            storage: gated.clone(),
            llm: llm.clone(),
            preferences: preferences.clone(),
        },
        SessionOptions::default(),
    ));

    Harness {
        session,
        llm,
        storage,
        gated,
        preferences,
    }
}

/// Encodes payloads as `data:` lines.
pub fn sse(payloads: &[&str]) -> Vec<u8> {
    payloads
        .iter()
        .map(|payload| format!("data: {payload}\n"))
        .collect::<String>()
        .into_bytes()
}
