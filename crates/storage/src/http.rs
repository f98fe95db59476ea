use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use snafu::ResultExt;

use super::error::{
    BuildHttpClientSnafu, DecodeResponseSnafu, HttpRequestSnafu, HttpStatusSnafu, NotFoundSnafu,
    StorageResult,
};
use super::ids::{ConversationId, MessageId, PresetId};
use super::types::{
    BackendSetting, ConversationPatch, ConversationRecord, FormatPreset, FormatPresetPatch,
    MessagePatch, MessageRecord, NewConversation, NewFormatPreset, PresetKind,
};
use super::{BoxFuture, ConversationStore, FormatPresetStore, MessageStore, SettingsStore};

/// Client for the REST conversation/settings service.
#[derive(Debug, Clone)]
pub struct RestStorage {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RestStorage {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> StorageResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context(BuildHttpClientSnafu {
                stage: "rest-storage-build-client",
            })?;
        Ok(Self::with_client(client, base_url, token))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            token: token.filter(|token| !token.trim().is_empty()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        stage: &'static str,
        entity: &'static str,
        id: String,
    ) -> StorageResult<Response> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .context(HttpRequestSnafu { stage })?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return NotFoundSnafu { stage, entity, id }.fail();
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                stage,
                status = status.as_u16(),
                "storage service rejected request"
            );
            return HttpStatusSnafu {
                stage,
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(
        response: Response,
        stage: &'static str,
    ) -> StorageResult<T> {
        response.json::<T>().await.context(DecodeResponseSnafu { stage })
    }
}

impl ConversationStore for RestStorage {
    fn list_conversations(&self) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let request = self.client.get(self.url("/conversations/"));
            let response = self
                .send(request, "list-conversations", "conversation", "*".to_string())
                .await?;
            Self::decode(response, "decode-conversations").await
        })
    }

    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let request = self.client.post(self.url("/conversations/")).json(&input);
            let response = self
                .send(request, "create-conversation", "conversation", "new".to_string())
                .await?;
            Self::decode(response, "decode-created-conversation").await
        })
    }

    fn rename_conversation(
        &self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let request = self
                .client
                .patch(self.url(&format!("/conversations/{conversation_id}")))
                .json(&patch);
            let response = self
                .send(
                    request,
                    "rename-conversation",
                    "conversation",
                    conversation_id.to_string(),
                )
                .await?;
            Self::decode(response, "decode-renamed-conversation").await
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let request = self
                .client
                .delete(self.url(&format!("/conversations/{conversation_id}")));
            self.send(
                request,
                "delete-conversation",
                "conversation",
                conversation_id.to_string(),
            )
            .await?;
            Ok(())
        })
    }
}

impl MessageStore for RestStorage {
    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.url(&format!("/conversations/{conversation_id}/messages")));
            let response = self
                .send(
                    request,
                    "list-messages",
                    "conversation",
                    conversation_id.to_string(),
                )
                .await?;
            Self::decode(response, "decode-messages").await
        })
    }

    fn update_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let request = self
                .client
                .patch(self.url(&format!(
                    "/conversations/{conversation_id}/messages/{message_id}"
                )))
                .json(&patch);
            let response = self
                .send(request, "update-message", "message", message_id.to_string())
                .await?;
            Self::decode(response, "decode-updated-message").await
        })
    }

    fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let request = self.client.delete(self.url(&format!(
                "/conversations/{conversation_id}/messages/{message_id}"
            )));
            self.send(request, "delete-message", "message", message_id.to_string())
                .await?;
            Ok(())
        })
    }
}

impl SettingsStore for RestStorage {
    fn list_backend_settings(&self) -> BoxFuture<'_, StorageResult<Vec<BackendSetting>>> {
        Box::pin(async move {
            let request = self.client.get(self.url("/settings/backends"));
            let response = self
                .send(request, "list-backend-settings", "settings", "*".to_string())
                .await?;
            Self::decode(response, "decode-backend-settings").await
        })
    }

    fn save_backend_setting(
        &self,
        setting: BackendSetting,
    ) -> BoxFuture<'_, StorageResult<BackendSetting>> {
        Box::pin(async move {
            let backend = setting.backend.clone();
            let request = self.client.post(self.url("/settings/backends")).json(&setting);
            let response = self
                .send(request, "save-backend-setting", "settings", backend)
                .await?;
            Self::decode(response, "decode-saved-backend-setting").await
        })
    }
}

impl FormatPresetStore for RestStorage {
    fn list_presets(&self, kind: PresetKind) -> BoxFuture<'_, StorageResult<Vec<FormatPreset>>> {
        Box::pin(async move {
            let request = self.client.get(self.url(kind.path()));
            let response = self
                .send(request, "list-presets", "preset", "*".to_string())
                .await?;
            Self::decode(response, "decode-presets").await
        })
    }

    fn create_preset(
        &self,
        kind: PresetKind,
        input: NewFormatPreset,
    ) -> BoxFuture<'_, StorageResult<FormatPreset>> {
        Box::pin(async move {
            let request = self
                .client
                .post(self.url(kind.path()))
                .json(&input.to_wire(kind));
            let response = self
                .send(request, "create-preset", "preset", "new".to_string())
                .await?;
            Self::decode(response, "decode-created-preset").await
        })
    }

    fn update_preset(
        &self,
        kind: PresetKind,
        preset_id: PresetId,
        patch: FormatPresetPatch,
    ) -> BoxFuture<'_, StorageResult<FormatPreset>> {
        Box::pin(async move {
            let request = self
                .client
                .patch(self.url(&format!("{}/{preset_id}", kind.path())))
                .json(&patch.to_wire(kind));
            let response = self
                .send(request, "update-preset", "preset", preset_id.to_string())
                .await?;
            Self::decode(response, "decode-updated-preset").await
        })
    }

    fn delete_preset(
        &self,
        kind: PresetKind,
        preset_id: PresetId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let request = self
                .client
                .delete(self.url(&format!("{}/{preset_id}", kind.path())));
            self.send(request, "delete-preset", "preset", preset_id.to_string())
                .await?;
            Ok(())
        })
    }
}
