use serde::{Deserialize, Serialize};

/// Active LLM provider settings, read from the settings collaborator
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfiguration {
    pub enabled: bool,
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub base_url: Option<String>,
}

impl ProviderConfiguration {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            enabled: true,
            provider: provider.into(),
            model: model.into(),
            api_key: api_key.into(),
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

// Keeps the key out of logs
impl std::fmt::Debug for ProviderConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfiguration")
            .field("enabled", &self.enabled)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &format_args!("{}...", self.api_key.chars().take(3).collect::<String>()))
            .field("base_url", &self.base_url)
            .finish()
    }
}
