//! Provider configuration for ai-prompt nodes

use serde::{Deserialize, Serialize};

/// An OpenAI-compatible chat completion endpoint
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`
    pub base_url: String,

    /// API key; `$VAR` / `${VAR}` references are expanded from the environment
    pub api_key: Option<String>,

    /// Default model when a node does not set one
    pub model: Option<String>,

    /// HTTP client timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_timeout() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            model: None,
            timeout: default_timeout(),
        }
    }
}

impl ProviderConfig {
    /// API key with environment references expanded
    ///
    /// An unset variable yields `None` rather than a literal `$VAR` header.
    pub fn resolved_api_key(&self) -> Option<String> {
        let raw = self.api_key.as_deref()?;
        match shellexpand::env(raw) {
            Ok(expanded) if !expanded.is_empty() => Some(expanded.into_owned()),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Could not expand provider api_key");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_from_toml() {
        let provider: ProviderConfig = toml::from_str(
            r#"
            base_url = "http://localhost:11434/v1"
            model = "llama3"
        "#,
        )
        .unwrap();
        assert_eq!(provider.model.as_deref(), Some("llama3"));
        assert_eq!(provider.timeout, 120);
        assert!(provider.resolved_api_key().is_none());
    }

    #[test]
    fn test_literal_api_key() {
        let provider = ProviderConfig {
            base_url: "https://example.invalid/v1".into(),
            api_key: Some("sk-literal".into()),
            ..Default::default()
        };
        assert_eq!(provider.resolved_api_key().as_deref(), Some("sk-literal"));
    }

    #[test]
    fn test_unset_env_api_key() {
        let provider = ProviderConfig {
            base_url: "https://example.invalid/v1".into(),
            api_key: Some("$AGENT_FLOW_SURELY_UNSET_KEY_VAR".into()),
            ..Default::default()
        };
        assert!(provider.resolved_api_key().is_none());
    }
}
