use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt, ensure};
use structura_llm::{
    Backend, GenerationRequest, LlmService, OutputFormat, StreamOutcome, StreamUpdate,
    consume_event_stream, fetch_catalog,
};
use structura_storage::{
    BackendSetting, ConversationId, ConversationPatch, ConversationRecord, FormatPreset,
    MessageId, MessagePatch, MessageRole, NewConversation, NewFormatPreset, PreferenceStore,
    PresetId, PresetKind, Storage,
};
use tokio::sync::{oneshot, watch};

use super::message::{
    GenerationId, Message, MessageKey, MessageMeta, PhaseTransition,
};
use super::snapshot::SessionSnapshot;
use crate::error::{
    ApiSnafu, BusySnafu, DisconnectedSnafu, EmptyPromptSnafu, InvalidFormatSpecSnafu,
    MessageNotFoundSnafu, NoConversationSnafu, NoModelSnafu, NoPresetsSnafu,
    NotAUserMessageSnafu, PresetNotFoundSnafu, SessionError, SessionResult, StorageSnafu,
    UnsupportedFormatSnafu,
};
use crate::format::{ValidatedSpec, preset_kind};
use crate::preferences::{DEFAULT_HISTORY_LIMIT, Preferences};
use crate::registry::{FetchApplied, ModelSelection};

pub const GENERIC_FAILURE_NOTICE: &str = "Generation failed. Please try again.";

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionServices {
    pub storage: Arc<dyn Storage>,
    pub llm: Arc<dyn LlmService>,
    pub preferences: Arc<dyn PreferenceStore>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub history_limit: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Server ids and accumulated content of the generation being streamed.
struct StreamTracker {
    user: MessageKey,
    assistant: MessageKey,
    content: String,
}

/// Ends a generation on every exit path, including the owning future being dropped.
struct GenerationGuard<'a> {
    session: &'a ChatSession,
    generation: GenerationId,
    placeholder: Option<MessageKey>,
    armed: bool,
}

impl GenerationGuard<'_> {
    fn finish(mut self, outcome: StreamOutcome) -> StreamOutcome {
        self.armed = false;
        self.session
            .finish_generation(self.generation, self.placeholder, outcome)
    }
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.finish_generation(
                self.generation,
                self.placeholder,
                StreamOutcome::Failed("generation was interrupted".to_string()),
            );
        }
    }
}

struct SendPlan {
    backend: Backend,
    model: String,
}

/// One conversation view: messages, selection and the send/stream cycle.
///
/// Shared by reference; every mutation publishes a whole new [`SessionSnapshot`].
pub struct ChatSession {
    storage: Arc<dyn Storage>,
    llm: Arc<dyn LlmService>,
    preferences: Preferences,
    options: SessionOptions,
    state: ArcSwap<SessionSnapshot>,
    writer: Mutex<()>,
    revision: watch::Sender<u64>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
    next_generation: AtomicU64,
}

impl ChatSession {
    pub fn new(services: SessionServices, options: SessionOptions) -> Self {
        let (revision, _) = watch::channel(0);
        let snapshot = SessionSnapshot {
            history: crate::preferences::PromptHistory::new(options.history_limit),
            ..SessionSnapshot::default()
        };

        Self {
            storage: services.storage,
            llm: services.llm,
            preferences: Preferences::new(services.preferences),
            options,
            state: ArcSwap::from_pointee(snapshot),
            writer: Mutex::new(()),
            revision,
            cancel: Mutex::new(None),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.state.load_full()
    }

    /// Revision counter bumped on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn update<R>(&self, mutate: impl FnOnce(&mut SessionSnapshot) -> R) -> R {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = SessionSnapshot::clone(&self.state.load());
        let format = next.format.active();
        let result = mutate(&mut next);
        // Presets belong to one format.
        if next.format.active() != format {
            next.presets.clear();
        }
        self.state.store(Arc::new(next));
        self.revision.send_modify(|revision| *revision += 1);
        result
    }

    /// Restores persisted preferences and loads everything the session starts from.
    ///
    /// Failures are logged and leave the affected part empty.
    pub async fn start(&self) {
        let last_models = self.preferences.backend_models().await;
        let backend = self
            .preferences
            .selected_backend()
            .await
            .unwrap_or_default();
        let history = self
            .preferences
            .prompt_history(self.options.history_limit)
            .await;

        self.update(|snapshot| {
            snapshot.selection = ModelSelection::new(backend, last_models);
            snapshot.history = history;
        });
        tracing::info!(backend = %backend, "session starting");

        if let Err(error) = self.fetch_capabilities().await {
            tracing::warn!(error = %error, "capabilities unavailable, offering default only");
        }
        if let Err(error) = self.load_conversations().await {
            tracing::warn!(error = %error, "failed to load conversations");
        }
        if let Err(error) = self.load_backend_settings().await {
            tracing::warn!(error = %error, "failed to load backend settings");
        }
        self.refresh_models().await;
    }

    // Selection.

    pub async fn fetch_capabilities(&self) -> SessionResult<()> {
        let capabilities = self.llm.capabilities().await.context(ApiSnafu {
            stage: "fetch-capabilities",
        })?;

        self.update(|snapshot| {
            snapshot.selection.set_capabilities(capabilities);
            let active = snapshot.format.active();
            if !snapshot.selection.supports(active) && snapshot.format.reset_to_default() {
                tracing::info!(format = %active, "output format unsupported by backend, using default");
            }
        });
        Ok(())
    }

    /// Resets selection for `backend`, then loads its saved connection and models.
    pub async fn switch_backend(&self, backend: Backend) {
        self.update(|snapshot| {
            snapshot
                .selection
                .switch_backend(backend, &mut snapshot.format);
        });
        self.preferences.save_selected_backend(backend).await;

        if let Err(error) = self.load_backend_settings().await {
            tracing::warn!(backend = %backend, error = %error, "keeping default connection");
        }
        self.refresh_models().await;
    }

    /// Fetches the model list for the current backend and connection.
    ///
    /// Returns `false` when the result arrived too late to apply.
    pub async fn refresh_models(&self) -> bool {
        let ticket = self.update(|snapshot| snapshot.selection.begin_fetch());
        let catalog = fetch_catalog(self.llm.as_ref(), ticket.backend, &ticket.connection).await;

        let (applied, last_models) = self.update(|snapshot| {
            let applied = snapshot.selection.apply_fetch(&ticket, catalog);
            if let FetchApplied::Applied {
                connected: false, ..
            } = applied
                && snapshot.format.reset_to_default()
            {
                tracing::info!(backend = %ticket.backend, "backend disconnected, using default format");
            }
            (applied, snapshot.selection.last_models().clone())
        });

        match applied {
            FetchApplied::Stale => false,
            FetchApplied::Applied { model_cleared, .. } => {
                if model_cleared {
                    self.preferences.save_backend_models(&last_models).await;
                }
                true
            }
        }
    }

    pub async fn select_model(&self, model: Option<String>) {
        let last_models = self.update(|snapshot| {
            snapshot.selection.select_model(model);
            snapshot.selection.last_models().clone()
        });
        self.preferences.save_backend_models(&last_models).await;
    }

    pub fn select_format(&self, format: OutputFormat) -> SessionResult<()> {
        self.update(|snapshot| {
            let backend = snapshot.selection.backend();
            ensure!(
                snapshot.selection.supports(format),
                UnsupportedFormatSnafu {
                    stage: "select-format",
                    backend,
                    format,
                }
            );
            snapshot.format.select(format);
            Ok(())
        })
    }

    /// Stores a spec for the active format. An invalid spec leaves the stored one untouched.
    pub fn set_format_spec(&self, spec: &str) -> SessionResult<ValidatedSpec> {
        self.update(|snapshot| {
            let format = snapshot.format.active();
            snapshot
                .format
                .set_spec(spec)
                .context(InvalidFormatSpecSnafu {
                    stage: "set-format-spec",
                    format,
                })
        })
    }

    // Format presets.

    fn active_preset_kind(&self, stage: &'static str) -> SessionResult<(OutputFormat, PresetKind)> {
        let format = self.snapshot().format.active();
        let kind = preset_kind(format).context(NoPresetsSnafu { stage, format })?;
        Ok((format, kind))
    }

    /// Reloads the saved specs of the active format.
    pub async fn load_presets(&self) -> SessionResult<Vec<FormatPreset>> {
        let (format, kind) = self.active_preset_kind("load-presets")?;
        let presets = self
            .storage
            .list_presets(kind)
            .await
            .context(StorageSnafu {
                stage: "load-presets",
            })?;

        self.update(|snapshot| {
            if snapshot.format.active() == format {
                snapshot.presets = presets.clone();
            }
        });
        Ok(presets)
    }

    /// Makes a saved spec the spec of the active format. It is validated like a typed one.
    pub async fn apply_preset(&self, preset_id: PresetId) -> SessionResult<ValidatedSpec> {
        let (format, _) = self.active_preset_kind("apply-preset")?;
        let cached = self
            .snapshot()
            .presets
            .iter()
            .find(|preset| preset.id == preset_id)
            .cloned();
        let preset = match cached {
            Some(preset) => preset,
            None => self
                .load_presets()
                .await?
                .into_iter()
                .find(|preset| preset.id == preset_id)
                .context(PresetNotFoundSnafu {
                    stage: "apply-preset",
                    preset_id,
                })?,
        };

        let validated = self.update(|snapshot| {
            ensure!(
                snapshot.format.active() == format,
                PresetNotFoundSnafu {
                    stage: "apply-preset",
                    preset_id,
                }
            );
            snapshot
                .format
                .set_spec(&preset.body)
                .context(InvalidFormatSpecSnafu {
                    stage: "apply-preset",
                    format,
                })
        })?;
        tracing::debug!(preset_id = %preset_id, format = %format, "applied format preset");
        Ok(validated)
    }

    /// Saves the spec of the active format under `name`.
    pub async fn save_preset(&self, name: impl Into<String>) -> SessionResult<FormatPreset> {
        let (format, kind) = self.active_preset_kind("save-preset")?;
        let body = self
            .snapshot()
            .format
            .spec_for(format)
            .unwrap_or_default()
            .to_string();

        let preset = self
            .storage
            .create_preset(
                kind,
                NewFormatPreset {
                    name: name.into(),
                    body,
                },
            )
            .await
            .context(StorageSnafu {
                stage: "save-preset",
            })?;

        self.update(|snapshot| {
            if snapshot.format.active() == format {
                snapshot.presets.insert(0, preset.clone());
            }
        });
        Ok(preset)
    }

    /// Deletes a saved spec of the active format. One the store no longer has is dropped locally.
    pub async fn delete_preset(&self, preset_id: PresetId) -> SessionResult<()> {
        let (_, kind) = self.active_preset_kind("delete-preset")?;

        match self.storage.delete_preset(kind, preset_id).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {
                tracing::debug!(preset_id = %preset_id, "preset already gone");
            }
            Err(source) => {
                return Err(SessionError::Storage {
                    stage: "delete-preset",
                    source,
                });
            }
        }

        self.update(|snapshot| snapshot.presets.retain(|preset| preset.id != preset_id));
        Ok(())
    }

    pub fn set_parameters(&self, parameters: Map<String, Value>) {
        self.update(|snapshot| snapshot.parameters = parameters);
    }

    pub fn set_prompt(&self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        self.update(|snapshot| {
            let transition = if prompt.is_empty() {
                PhaseTransition::ClearDraft
            } else {
                PhaseTransition::Compose
            };
            if let Ok(next) = snapshot.phase.apply(transition) {
                snapshot.phase = next;
            }
            snapshot.prompt = prompt;
        });
    }

    pub fn clear_notice(&self) {
        self.update(|snapshot| snapshot.notice = None);
    }

    // Backend settings.

    /// Loads saved settings and applies the one for the current backend, if any.
    pub async fn load_backend_settings(&self) -> SessionResult<()> {
        let settings = self
            .storage
            .list_backend_settings()
            .await
            .context(StorageSnafu {
                stage: "load-backend-settings",
            })?;

        self.update(|snapshot| {
            let backend = snapshot.selection.backend();
            if let Some(setting) = settings
                .iter()
                .find(|setting| setting.backend == backend.as_str())
            {
                snapshot.selection.apply_saved_setting(setting);
            }
            snapshot.backend_settings = settings;
        });
        Ok(())
    }

    /// Saves a setting; when it targets the current backend the live connection follows.
    pub async fn save_backend_setting(&self, setting: BackendSetting) -> SessionResult<BackendSetting> {
        let saved = self
            .storage
            .save_backend_setting(setting)
            .await
            .context(StorageSnafu {
                stage: "save-backend-setting",
            })?;

        let applied = self.update(|snapshot| {
            match snapshot
                .backend_settings
                .iter_mut()
                .find(|existing| existing.backend == saved.backend)
            {
                Some(existing) => *existing = saved.clone(),
                None => snapshot.backend_settings.push(saved.clone()),
            }
            snapshot.selection.apply_saved_setting(&saved)
        });

        if applied {
            self.refresh_models().await;
        }
        Ok(saved)
    }

    // Conversations.

    /// Reloads the conversation list and selects the first one when none is current.
    pub async fn load_conversations(&self) -> SessionResult<()> {
        let conversations = self
            .storage
            .list_conversations()
            .await
            .context(StorageSnafu {
                stage: "load-conversations",
            })?;

        let fallback = self.update(|snapshot| {
            snapshot.conversations = conversations;
            let current_exists = snapshot
                .conversation_id
                .is_some_and(|id| snapshot.conversations.iter().any(|record| record.id == id));
            if current_exists || snapshot.phase.is_active() {
                return None;
            }
            snapshot.conversation_id = None;
            snapshot.messages.clear();
            snapshot.conversations.first().map(|record| record.id)
        });

        if let Some(conversation_id) = fallback {
            self.select_conversation(conversation_id).await?;
        }
        Ok(())
    }

    pub async fn select_conversation(&self, conversation_id: ConversationId) -> SessionResult<()> {
        self.ensure_idle("select-conversation")?;
        let records = self
            .storage
            .list_messages(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "load-messages",
            })?;

        self.update(|snapshot| {
            ensure!(
                !snapshot.phase.is_active(),
                BusySnafu {
                    stage: "select-conversation"
                }
            );
            snapshot.conversation_id = Some(conversation_id);
            snapshot.messages = records.into_iter().map(Message::from_record).collect();
            Ok(())
        })
    }

    pub async fn create_conversation(&self, title: Option<String>) -> SessionResult<ConversationRecord> {
        self.ensure_idle("create-conversation")?;
        self.open_new_conversation(title).await
    }

    pub async fn rename_conversation(
        &self,
        conversation_id: ConversationId,
        title: impl Into<String>,
    ) -> SessionResult<ConversationRecord> {
        let record = self
            .storage
            .rename_conversation(
                conversation_id,
                ConversationPatch {
                    title: title.into(),
                },
            )
            .await
            .context(StorageSnafu {
                stage: "rename-conversation",
            })?;

        self.update(|snapshot| {
            if let Some(existing) = snapshot
                .conversations
                .iter_mut()
                .find(|existing| existing.id == record.id)
            {
                *existing = record.clone();
            }
        });
        Ok(record)
    }

    /// Deletes a conversation; deleting the current one falls back to the first remaining.
    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> SessionResult<()> {
        let snapshot = self.snapshot();
        if snapshot.conversation_id == Some(conversation_id) {
            ensure!(
                !snapshot.is_loading(),
                BusySnafu {
                    stage: "delete-conversation"
                }
            );
        }

        match self.storage.delete_conversation(conversation_id).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {
                tracing::debug!(conversation_id = %conversation_id, "conversation already gone");
            }
            Err(source) => {
                return Err(SessionError::Storage {
                    stage: "delete-conversation",
                    source,
                });
            }
        }

        let fallback = self.update(|snapshot| {
            snapshot
                .conversations
                .retain(|record| record.id != conversation_id);
            if snapshot.conversation_id != Some(conversation_id) {
                return None;
            }
            snapshot.conversation_id = None;
            snapshot.messages.clear();
            snapshot.conversations.first().map(|record| record.id)
        });

        if let Some(next) = fallback {
            self.select_conversation(next).await?;
        }
        Ok(())
    }

    async fn open_new_conversation(&self, title: Option<String>) -> SessionResult<ConversationRecord> {
        let record = self
            .storage
            .create_conversation(NewConversation { title })
            .await
            .context(StorageSnafu {
                stage: "create-conversation",
            })?;
        tracing::info!(conversation_id = %record.id, "created conversation");

        self.update(|snapshot| {
            snapshot.conversations.insert(0, record.clone());
            snapshot.conversation_id = Some(record.id);
            snapshot.messages.clear();
        });
        Ok(record)
    }

    // Messages.

    /// Removes one message. A message the store no longer has is removed locally too.
    pub async fn delete_message(&self, message_id: MessageId) -> SessionResult<()> {
        let conversation_id = self.current_conversation_id("delete-message")?;

        match self
            .storage
            .delete_message(conversation_id, message_id)
            .await
        {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {
                tracing::debug!(message_id = %message_id, "message already gone, removing locally");
            }
            Err(source) => {
                return Err(SessionError::Storage {
                    stage: "delete-message",
                    source,
                });
            }
        }

        self.update(|snapshot| {
            if let Some(index) = snapshot
                .messages
                .iter()
                .position(|message| message.id() == Some(message_id))
            {
                snapshot.messages.remove(index);
            }
        });
        Ok(())
    }

    /// Replaces a message's content without generating, then reloads the list.
    pub async fn edit_message_content(
        &self,
        message_id: MessageId,
        content: impl Into<String>,
    ) -> SessionResult<()> {
        let conversation_id = self.current_conversation_id("edit-message")?;
        self.ensure_idle("edit-message")?;

        self.storage
            .update_message(
                conversation_id,
                message_id,
                MessagePatch {
                    content: content.into(),
                },
            )
            .await
            .context(StorageSnafu {
                stage: "edit-message",
            })?;

        let records = self
            .storage
            .list_messages(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "reload-messages",
            })?;
        self.update(|snapshot| {
            if snapshot.conversation_id == Some(conversation_id) {
                snapshot.messages = records.into_iter().map(Message::from_record).collect();
            }
        });
        Ok(())
    }

    // Generation.

    /// Sends the current draft prompt.
    pub async fn send(&self) -> SessionResult<StreamOutcome> {
        let prompt = self.snapshot().prompt.clone();
        self.submit(prompt, None, true).await
    }

    /// Sends `text` without touching the draft prompt.
    pub async fn send_text(&self, text: impl Into<String>) -> SessionResult<StreamOutcome> {
        self.submit(text.into(), None, false).await
    }

    /// Replaces a user message and regenerates from it, dropping everything after it.
    pub async fn edit_and_resend(
        &self,
        message_id: MessageId,
        text: impl Into<String>,
    ) -> SessionResult<StreamOutcome> {
        self.submit(text.into(), Some(message_id), false).await
    }

    /// Signals the running generation to stop. Returns whether one was running.
    pub fn stop(&self) -> bool {
        match self.take_cancel_handle() {
            Some(cancel_tx) => {
                tracing::info!("stopping generation");
                cancel_tx.send(()).is_ok()
            }
            None => false,
        }
    }

    async fn submit(
        &self,
        text: String,
        edit: Option<MessageId>,
        clear_draft: bool,
    ) -> SessionResult<StreamOutcome> {
        let generation = GenerationId(self.next_generation.fetch_add(1, Ordering::Relaxed) + 1);
        let plan = self.update(|snapshot| claim(snapshot, generation, &text, edit, clear_draft))?;
        let mut guard = GenerationGuard {
            session: self,
            generation,
            placeholder: None,
            armed: true,
        };
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel_tx);

        let conversation_id = match self.snapshot().conversation_id {
            Some(conversation_id) => conversation_id,
            None => self.open_new_conversation(None).await?.id,
        };

        let (request, tracker, history) = self.update(|snapshot| {
            let compiled = snapshot.format.compile(&text);
            let output_format = snapshot.format.active();
            let meta = MessageMeta {
                backend: Some(plan.backend),
                model: Some(plan.model.clone()),
                output_format: Some(output_format),
                format_spec: snapshot.format.spec().map(str::to_string),
                parameters: Some(snapshot.parameters.clone()),
            };

            let mut user = Message::pending(MessageRole::User, compiled.outgoing.clone(), meta.clone());
            if let Some(message_id) = edit {
                if let Some(index) = snapshot
                    .messages
                    .iter()
                    .position(|message| message.id() == Some(message_id))
                {
                    snapshot.messages.truncate(index);
                }
                user.key = MessageKey::Persisted(message_id);
            }
            let assistant = Message::pending(MessageRole::Assistant, "", meta);
            let tracker = StreamTracker {
                user: user.key,
                assistant: assistant.key,
                content: String::new(),
            };
            snapshot.messages.push(user);
            snapshot.messages.push(assistant);
            snapshot.reply = Some(tracker.assistant);
            snapshot.history.push(compiled.display);

            let request = GenerationRequest {
                conversation_id,
                message: compiled.outgoing,
                backend: plan.backend,
                model: plan.model.clone(),
                output_format,
                format_spec: snapshot.format.spec().map(str::to_string),
                parameters: request_parameters(snapshot),
                message_id: edit,
            };
            (request, tracker, snapshot.history.clone())
        });
        guard.placeholder = Some(tracker.assistant);
        self.preferences.save_prompt_history(&history).await;

        tracing::info!(
            generation = %generation,
            conversation_id = %conversation_id,
            backend = %plan.backend,
            model = %plan.model,
            output_format = %request.output_format,
            edit = ?edit,
            "sending prompt"
        );

        let opened = tokio::select! {
            biased;
            _ = &mut cancel_rx => None,
            opened = self.llm.generate(request) => Some(opened),
        };
        let body = match opened {
            None => return Ok(guard.finish(StreamOutcome::Cancelled)),
            Some(Err(error)) => {
                tracing::warn!(generation = %generation, error = %error, "failed to open generation stream");
                return Ok(guard.finish(StreamOutcome::Failed(error.to_string())));
            }
            Some(Ok(body)) => body,
        };

        self.update(|snapshot| {
            if let Ok(next) = snapshot.phase.apply(PhaseTransition::Open(generation)) {
                snapshot.phase = next;
            }
        });

        let mut tracker = tracker;
        let outcome = consume_event_stream(body, cancel_rx, |update| {
            self.apply_stream_update(generation, &mut tracker, update);
        })
        .await;

        Ok(guard.finish(outcome))
    }

    fn apply_stream_update(
        &self,
        generation: GenerationId,
        tracker: &mut StreamTracker,
        update: StreamUpdate,
    ) {
        self.update(|snapshot| {
            if !snapshot.phase.accepts(generation) {
                tracing::debug!(generation = %generation, "dropping update for finished generation");
                return;
            }

            match update {
                StreamUpdate::UserMessageId(id) => {
                    rekey(&mut snapshot.messages, tracker.user, id);
                    tracker.user = MessageKey::Persisted(id);
                }
                StreamUpdate::AssistantMessageId(id) => {
                    rekey(&mut snapshot.messages, tracker.assistant, id);
                    tracker.assistant = MessageKey::Persisted(id);
                    snapshot.reply = Some(tracker.assistant);
                }
                StreamUpdate::Content(delta) => {
                    tracker.content.push_str(&delta);
                    if let Some(message) = snapshot
                        .messages
                        .iter_mut()
                        .find(|message| message.key == tracker.assistant)
                    {
                        *message = Message {
                            content: tracker.content.clone(),
                            ..message.clone()
                        };
                    }
                }
            }
        });
    }

    fn finish_generation(
        &self,
        generation: GenerationId,
        placeholder: Option<MessageKey>,
        outcome: StreamOutcome,
    ) -> StreamOutcome {
        drop(self.take_cancel_handle());

        self.update(|snapshot| {
            let transition = match &outcome {
                StreamOutcome::Completed => PhaseTransition::Complete(generation),
                StreamOutcome::Cancelled => PhaseTransition::Cancel(generation),
                StreamOutcome::Failed(reason) => PhaseTransition::Fail {
                    generation,
                    reason: reason.clone(),
                },
            };
            match snapshot.phase.apply(transition) {
                Ok(next) => snapshot.phase = next,
                Err(rejection) => {
                    tracing::debug!(generation = %generation, rejection = ?rejection, "generation already finished");
                }
            }

            // A reply that never received content is not kept, whatever the outcome.
            if let Some(placeholder) = placeholder
                && let Some(index) = snapshot.messages.iter().position(|message| {
                    message.key == placeholder
                        && message.key.is_pending()
                        && message.content.is_empty()
                })
            {
                snapshot.messages.remove(index);
                snapshot.reply = None;
            }

            if let StreamOutcome::Failed(_) = &outcome {
                snapshot.notice = Some(GENERIC_FAILURE_NOTICE.to_string());
            }
            snapshot.last_outcome = Some(outcome.clone());
        });

        self.update(|snapshot| {
            match snapshot.phase.apply(PhaseTransition::ResetToIdle(generation)) {
                Ok(next) => snapshot.phase = next,
                Err(rejection) => {
                    tracing::debug!(generation = %generation, rejection = ?rejection, "phase already moved on");
                }
            }
        });

        match &outcome {
            StreamOutcome::Completed => {
                tracing::info!(generation = %generation, "generation completed");
            }
            StreamOutcome::Cancelled => {
                tracing::info!(generation = %generation, "generation cancelled");
            }
            StreamOutcome::Failed(reason) => {
                tracing::warn!(generation = %generation, reason = %reason, "generation failed");
            }
        }
        outcome
    }

    fn take_cancel_handle(&self) -> Option<oneshot::Sender<()>> {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn ensure_idle(&self, stage: &'static str) -> SessionResult<()> {
        ensure!(!self.snapshot().is_loading(), BusySnafu { stage });
        Ok(())
    }

    fn current_conversation_id(&self, stage: &'static str) -> SessionResult<ConversationId> {
        self.snapshot()
            .conversation_id
            .context(NoConversationSnafu { stage })
    }
}

/// Validates a send and marks the generation as started, all against one snapshot.
fn claim(
    snapshot: &mut SessionSnapshot,
    generation: GenerationId,
    text: &str,
    edit: Option<MessageId>,
    clear_draft: bool,
) -> SessionResult<SendPlan> {
    let stage = "validate-send";
    ensure!(!snapshot.phase.is_active(), BusySnafu { stage });
    ensure!(!text.trim().is_empty(), EmptyPromptSnafu { stage });

    let backend = snapshot.selection.backend();
    ensure!(
        snapshot.selection.is_connected(),
        DisconnectedSnafu { stage, backend }
    );
    let model = snapshot
        .selection
        .model()
        .map(str::to_string)
        .context(NoModelSnafu { stage, backend })?;

    if let Some(message_id) = edit {
        let message = snapshot
            .message(message_id)
            .context(MessageNotFoundSnafu { stage, message_id })?;
        ensure!(
            message.role == MessageRole::User,
            NotAUserMessageSnafu { stage, message_id }
        );
    }

    snapshot.phase = snapshot
        .phase
        .apply(PhaseTransition::Begin(generation))
        .map_err(|_| BusySnafu { stage }.build())?;
    snapshot.notice = None;
    snapshot.last_outcome = None;
    snapshot.reply = None;
    if clear_draft {
        snapshot.prompt.clear();
    }

    Ok(SendPlan { backend, model })
}

/// User parameters plus the live connection of the active backend.
fn request_parameters(snapshot: &SessionSnapshot) -> Map<String, Value> {
    let mut parameters = snapshot.parameters.clone();
    let connection = snapshot.selection.connection();
    for (key, value) in [
        ("base_url", connection.base_url.as_ref()),
        ("api_key", connection.api_key.as_ref()),
    ] {
        match value {
            Some(value) => {
                parameters.insert(key.to_string(), Value::String(value.clone()));
            }
            None => {
                parameters.remove(key);
            }
        }
    }
    parameters
}

fn rekey(messages: &mut [Message], key: MessageKey, id: MessageId) {
    if let Some(message) = messages.iter_mut().find(|message| message.key == key) {
        message.key = MessageKey::Persisted(id);
    }
}
