use anyhow::{anyhow, Result};
use log::info;
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::models::settings::ProviderConfiguration;

/// Current AI provider settings, replaceable at runtime
#[derive(Clone, Debug)]
pub struct MemorySettingsService {
    current: Arc<RwLock<ProviderConfiguration>>,
}

impl MemorySettingsService {
    pub fn new(configuration: ProviderConfiguration) -> Self {
        Self {
            current: Arc::new(RwLock::new(configuration)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut configuration = ProviderConfiguration::new(
            config.ai_provider.clone(),
            config.ai_model.clone().unwrap_or_default(),
            config.ai_api_key.clone(),
        );
        configuration.enabled = config.ai_chat_enabled;
        configuration.base_url = config.ai_base_url.clone();
        Self::new(configuration)
    }

    pub fn get(&self) -> Result<ProviderConfiguration> {
        let current = self.current.read().map_err(|_| anyhow!("Failed to lock settings"))?;
        Ok(current.clone())
    }

    pub fn replace(&self, configuration: ProviderConfiguration) -> Result<()> {
        info!("AI provider settings updated: {:?}", configuration);
        let mut current = self.current.write().map_err(|_| anyhow!("Failed to lock settings"))?;
        *current = configuration;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_swaps_configuration_for_all_clones() {
        let settings = MemorySettingsService::new(ProviderConfiguration::new("openai", "", "sk-1"));
        let shared = settings.clone();
        settings
            .replace(ProviderConfiguration::new("anthropic", "claude-3-5-haiku-latest", "sk-ant").disabled())
            .unwrap();

        let current = shared.get().unwrap();
        assert_eq!(current.provider, "anthropic");
        assert!(!current.enabled);
    }
}
