//! Backend, model and connection selection with stale-fetch rejection.

use std::collections::HashMap;

use structura_llm::{Backend, CapabilityMap, ConnectionParams, ModelCatalog, OutputFormat};
use structura_storage::BackendSetting;

use crate::format::FormatState;

/// Issued when a model-list fetch starts. Only the newest ticket may apply its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub backend: Backend,
    pub connection: ConnectionParams,
    token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchApplied {
    Stale,
    Applied {
        connected: bool,
        model_cleared: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    backend: Backend,
    model: Option<String>,
    catalog: ModelCatalog,
    connection: ConnectionParams,
    capabilities: CapabilityMap,
    last_models: HashMap<Backend, String>,
    fetch_token: u64,
}

impl Default for ModelSelection {
    fn default() -> Self {
        Self::new(Backend::default(), HashMap::new())
    }
}

impl ModelSelection {
    pub fn new(backend: Backend, last_models: HashMap<Backend, String>) -> Self {
        Self {
            backend,
            model: last_models.get(&backend).cloned(),
            catalog: ModelCatalog::empty(),
            connection: backend.default_connection(),
            capabilities: CapabilityMap::unfetched(),
            last_models,
            fetch_token: 0,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn connection(&self) -> &ConnectionParams {
        &self.connection
    }

    pub fn capabilities(&self) -> &CapabilityMap {
        &self.capabilities
    }

    pub fn last_models(&self) -> &HashMap<Backend, String> {
        &self.last_models
    }

    pub fn is_connected(&self) -> bool {
        self.catalog.is_connected()
    }

    /// Formats selectable on the active backend, `default` first.
    pub fn formats(&self) -> Vec<OutputFormat> {
        self.capabilities.formats_for(self.backend)
    }

    pub fn supports(&self, format: OutputFormat) -> bool {
        self.capabilities.supports(self.backend, format)
    }

    /// Resets everything tied to the previous backend.
    ///
    /// Pending fetches become stale, the model comes from the last-used cache and
    /// the connection falls back to the backend's hard defaults. Returns whether the
    /// active format had to fall back to `default`.
    pub fn switch_backend(&mut self, backend: Backend, format: &mut FormatState) -> bool {
        self.backend = backend;
        self.model = self.last_models.get(&backend).cloned();
        self.catalog = ModelCatalog::empty();
        self.connection = backend.default_connection();
        self.fetch_token += 1;

        let active = format.active();
        if self.supports(active) {
            return false;
        }
        tracing::info!(backend = %backend, format = %active, "output format unsupported by backend, using default");
        format.reset_to_default()
    }

    pub fn set_capabilities(&mut self, capabilities: CapabilityMap) {
        self.capabilities = capabilities;
    }

    pub fn begin_fetch(&mut self) -> FetchTicket {
        self.fetch_token += 1;
        FetchTicket {
            backend: self.backend,
            connection: self.connection.clone(),
            token: self.fetch_token,
        }
    }

    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        ticket.token == self.fetch_token && ticket.backend == self.backend
    }

    /// Applies a fetched model list if its ticket is still current.
    ///
    /// A selected model missing from a non-empty list is cleared, never replaced.
    pub fn apply_fetch(&mut self, ticket: &FetchTicket, catalog: ModelCatalog) -> FetchApplied {
        if !self.is_current(ticket) {
            tracing::debug!(
                backend = %ticket.backend,
                current_backend = %self.backend,
                "discarding stale model list"
            );
            return FetchApplied::Stale;
        }

        let connected = catalog.is_connected();
        let model_cleared = match self.model.as_deref() {
            Some(model) if connected && !catalog.contains(model) => {
                tracing::info!(backend = %self.backend, model, "selected model no longer offered");
                self.select_model(None);
                true
            }
            _ => false,
        };
        self.catalog = catalog;

        FetchApplied::Applied {
            connected,
            model_cleared,
        }
    }

    /// Overrides the connection with a saved setting for the active backend.
    ///
    /// Settings for another backend are ignored. Returns whether anything was applied.
    pub fn apply_saved_setting(&mut self, setting: &BackendSetting) -> bool {
        if setting.backend != self.backend.as_str() {
            return false;
        }
        self.set_connection(ConnectionParams::new(
            setting.base_url.clone(),
            setting.api_key.clone(),
        ));
        true
    }

    /// Replaces the connection; any fetch issued under the old one becomes stale.
    pub fn set_connection(&mut self, connection: ConnectionParams) {
        if self.connection == connection {
            return;
        }
        self.connection = connection;
        self.fetch_token += 1;
    }

    pub fn select_model(&mut self, model: Option<String>) {
        let model = model
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty());
        match &model {
            Some(model) => {
                self.last_models.insert(self.backend, model.clone());
            }
            None => {
                self.last_models.remove(&self.backend);
            }
        }
        self.model = model;
    }
}
