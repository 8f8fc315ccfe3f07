#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCatalogSource {
    ServiceApi,
    ConfiguredFallback,
}

/// Model list as presented to the model selector.
///
/// The order is the order reported by the generation service; the first entry is the
/// implicit default when nothing has been selected yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    pub models: Vec<Model>,
    pub source: ModelCatalogSource,
    pub warning: Option<String>,
}

impl ModelCatalog {
    pub fn from_service_api(models: Vec<Model>) -> Self {
        Self {
            models,
            source: ModelCatalogSource::ServiceApi,
            warning: None,
        }
    }

    pub fn from_configured_fallback(models: Vec<Model>, warning: String) -> Self {
        Self {
            models,
            source: ModelCatalogSource::ConfiguredFallback,
            warning: Some(warning),
        }
    }

    pub fn first_model_id(&self) -> Option<&str> {
        self.models.first().map(|model| model.id.as_str())
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.iter().any(|model| model.id == model_id)
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
