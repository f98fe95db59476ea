use std::collections::HashMap;

use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::ResultExt;
use structura_storage::{BoxFuture, ConversationId, MessageId};

use super::backend::{Backend, ConnectionParams};
use super::capabilities::CapabilityMap;
use super::error::{
    ApiResult, BuildHttpClientSnafu, DecodeResponseSnafu, HttpRequestSnafu, HttpStatusSnafu,
    StreamReadSnafu,
};
use super::model::{Model, ModelCatalog};
use super::output_format::OutputFormat;

/// Raw bytes of a generation response, in transport-sized chunks.
pub type ByteStream = BoxStream<'static, ApiResult<Vec<u8>>>;

/// Body of one generation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub conversation_id: ConversationId,
    pub message: String,
    pub backend: Backend,
    pub model: String,
    pub output_format: OutputFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_spec: Option<String>,
    pub parameters: Map<String, Value>,
    /// Set when re-running an edited message; the service rewrites history from it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

#[derive(Debug, Serialize)]
struct ModelListRequest<'a> {
    backend: Backend,
    parameters: &'a ConnectionParams,
}

#[derive(Debug, Deserialize)]
struct ModelListResponse {
    #[serde(default)]
    models: Vec<String>,
}

/// Capabilities, model listing and generation endpoints of the chat service.
pub trait LlmService: Send + Sync {
    fn capabilities(&self) -> BoxFuture<'_, ApiResult<CapabilityMap>>;
    fn list_models<'a>(
        &'a self,
        backend: Backend,
        connection: &'a ConnectionParams,
    ) -> BoxFuture<'a, ApiResult<Vec<Model>>>;
    /// Opens the event stream. A rejected request fails before any byte is yielded.
    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, ApiResult<ByteStream>>;
}

/// Lists models and folds a failure into an empty, disconnected catalog.
pub async fn fetch_catalog(
    service: &dyn LlmService,
    backend: Backend,
    connection: &ConnectionParams,
) -> ModelCatalog {
    match service.list_models(backend, connection).await {
        Ok(models) => ModelCatalog::from_provider_api(models),
        Err(error) => {
            tracing::warn!(backend = %backend, error = %error, "failed to fetch model list");
            ModelCatalog::from_failure(error.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context(BuildHttpClientSnafu {
                stage: "api-client-build",
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

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, builder: RequestBuilder, stage: &'static str) -> ApiResult<Response> {
        let builder = match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        };
        let response = builder.send().await.context(HttpRequestSnafu { stage })?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(stage, status = status.as_u16(), "chat service rejected request");
            return HttpStatusSnafu {
                stage,
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        Ok(response)
    }
}

impl LlmService for ApiClient {
    fn capabilities(&self) -> BoxFuture<'_, ApiResult<CapabilityMap>> {
        Box::pin(async move {
            let request = self.client.get(self.url("/llm/capabilities"));
            let response = self.send(request, "fetch-capabilities").await?;
            let raw = response
                .json::<HashMap<String, Vec<String>>>()
                .await
                .context(DecodeResponseSnafu {
                    stage: "decode-capabilities",
                })?;
            Ok(CapabilityMap::from_wire(raw))
        })
    }

    fn list_models<'a>(
        &'a self,
        backend: Backend,
        connection: &'a ConnectionParams,
    ) -> BoxFuture<'a, ApiResult<Vec<Model>>> {
        Box::pin(async move {
            let request = self
                .client
                .post(self.url("/llm/models"))
                .json(&ModelListRequest {
                    backend,
                    parameters: connection,
                });
            let response = self.send(request, "list-models").await?;
            let payload = response
                .json::<ModelListResponse>()
                .await
                .context(DecodeResponseSnafu {
                    stage: "decode-models",
                })?;
            Ok(payload.models.into_iter().map(Model::from_id).collect())
        })
    }

    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, ApiResult<ByteStream>> {
        Box::pin(async move {
            tracing::debug!(
                conversation_id = %request.conversation_id,
                backend = %request.backend,
                model = %request.model,
                output_format = %request.output_format,
                "opening generation stream"
            );
            let builder = self.client.post(self.url("/llm/generate")).json(&request);
            let response = self.send(builder, "open-generation").await?;

            let stream = response.bytes_stream().map(|chunk| {
                chunk.map(|bytes| bytes.to_vec()).context(StreamReadSnafu {
                    stage: "read-generation-chunk",
                })
            });
            Ok(stream.boxed())
        })
    }
}
