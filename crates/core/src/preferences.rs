//! Typed access to the process-wide key-value preferences.
//!
//! Preferences are best effort: read failures fall back to defaults and write
//! failures are logged, neither interrupts the session.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use structura_llm::Backend;
use structura_storage::PreferenceStore;

pub const BACKEND_MODELS_KEY: &str = "structura_backend_models";
pub const SELECTED_BACKEND_KEY: &str = "structura_selected_backend";
pub const PROMPT_HISTORY_KEY: &str = "structura_prompt_history";
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Recently sent prompts, newest last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptHistory {
    entries: VecDeque<String>,
    limit: usize,
}

impl Default for PromptHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl PromptHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
        }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = String>, limit: usize) -> Self {
        let mut history = Self::new(limit);
        for entry in entries {
            history.push(entry);
        }
        history
    }

    /// Records a prompt. Blank prompts and repeats of the newest entry are skipped.
    pub fn push(&mut self, prompt: impl Into<String>) -> bool {
        let prompt = prompt.into();
        if self.limit == 0
            || prompt.trim().is_empty()
            || self.entries.back() == Some(&prompt)
        {
            return false;
        }

        self.entries.push_back(prompt);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
        true
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn latest(&self) -> Option<&str> {
        self.entries.back().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone)]
pub struct Preferences {
    store: Arc<dyn PreferenceStore>,
}

impl Preferences {
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Self { store }
    }

    /// Last-used model per backend.
    pub async fn backend_models(&self) -> HashMap<Backend, String> {
        let Some(raw) = self.read(BACKEND_MODELS_KEY).await else {
            return HashMap::new();
        };

        match serde_json::from_str::<HashMap<String, String>>(&raw) {
            Ok(models) => models
                .into_iter()
                .filter_map(|(backend, model)| {
                    let backend = backend.parse::<Backend>().ok()?;
                    (!model.trim().is_empty()).then_some((backend, model))
                })
                .collect(),
            Err(error) => {
                tracing::warn!(key = BACKEND_MODELS_KEY, error = %error, "ignoring unreadable preference");
                HashMap::new()
            }
        }
    }

    pub async fn save_backend_models(&self, models: &HashMap<Backend, String>) {
        let raw = models
            .iter()
            .map(|(backend, model)| (backend.as_str(), model.as_str()))
            .collect::<HashMap<_, _>>();
        self.write_json(BACKEND_MODELS_KEY, &raw).await;
    }

    pub async fn selected_backend(&self) -> Option<Backend> {
        let raw = self.read(SELECTED_BACKEND_KEY).await?;
        match raw.parse::<Backend>() {
            Ok(backend) => Some(backend),
            Err(error) => {
                tracing::warn!(key = SELECTED_BACKEND_KEY, error = %error, "ignoring unreadable preference");
                None
            }
        }
    }

    pub async fn save_selected_backend(&self, backend: Backend) {
        if let Err(error) = self
            .store
            .set(SELECTED_BACKEND_KEY, backend.as_str().to_string())
            .await
        {
            tracing::warn!(key = SELECTED_BACKEND_KEY, error = %error, "failed to save preference");
        }
    }

    pub async fn prompt_history(&self, limit: usize) -> PromptHistory {
        let Some(raw) = self.read(PROMPT_HISTORY_KEY).await else {
            return PromptHistory::new(limit);
        };

        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(entries) => PromptHistory::from_entries(entries, limit),
            Err(error) => {
                tracing::warn!(key = PROMPT_HISTORY_KEY, error = %error, "ignoring unreadable preference");
                PromptHistory::new(limit)
            }
        }
    }

    pub async fn save_prompt_history(&self, history: &PromptHistory) {
        let entries = history.entries().collect::<Vec<_>>();
        self.write_json(PROMPT_HISTORY_KEY, &entries).await;
    }

    async fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(key, error = %error, "failed to read preference");
                None
            }
        }
    }

    async fn write_json<T: serde::Serialize>(&self, key: &str, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(key, error = %error, "failed to encode preference");
                return;
            }
        };
        if let Err(error) = self.store.set(key, raw).await {
            tracing::warn!(key, error = %error, "failed to save preference");
        }
    }
}
