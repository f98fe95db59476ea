#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Model {
    pub id: String,
}

impl Model {
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCatalogSource {
    ProviderApi,
    FetchFailed,
}

/// Result of one model-list fetch. A failed fetch is an empty catalog, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    pub models: Vec<Model>,
    pub source: ModelCatalogSource,
    pub warning: Option<String>,
}

impl ModelCatalog {
    /// Nothing fetched yet; reads as disconnected.
    pub fn empty() -> Self {
        Self::from_provider_api(Vec::new())
    }

    pub fn from_provider_api(models: Vec<Model>) -> Self {
        Self {
            models: models
                .into_iter()
                .filter(|model| !model.id.is_empty())
                .collect(),
            source: ModelCatalogSource::ProviderApi,
            warning: None,
        }
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_provider_api(ids.into_iter().map(Model::from_id).collect())
    }

    pub fn from_failure(warning: impl Into<String>) -> Self {
        Self {
            models: Vec::new(),
            source: ModelCatalogSource::FetchFailed,
            warning: Some(warning.into()),
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.models.is_empty()
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.iter().any(|model| model.id == model_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.models.iter().map(|model| model.id.clone()).collect()
    }
}
