//! Model-to-provider routing.
//!
//! Resolution order: explicit route (exact, then longest wildcard prefix),
//! model family prefix, configured default. A family prefix that implies a
//! provider (e.g. `claude*`) overrides the default so a misconfigured
//! default cannot send Anthropic models to OpenAI.

use std::collections::HashMap;

use crate::{config::RoutingConfig, error::ApiError};

/// Model family prefixes and the provider name they imply.
const FAMILY_PREFIXES: &[(&str, &str)] = &[
    ("claude", "anthropic"),
    ("gpt-", "openai"),
    ("o1", "openai"),
    ("o3", "openai"),
    ("text-embedding-", "openai"),
    ("llama", "groq"),
    ("mixtral", "groq"),
    ("gemma", "groq"),
];

#[derive(Debug, Clone)]
pub struct ModelRouter {
    exact: HashMap<String, String>,
    /// (prefix, provider), longest prefix first.
    wildcards: Vec<(String, String)>,
    default_provider: Option<String>,
    configured: Vec<String>,
}

impl ModelRouter {
    pub fn from_config(routing: &RoutingConfig, configured_providers: &[String]) -> Self {
        let mut exact = HashMap::new();
        let mut wildcards = Vec::new();

        for (pattern, provider) in &routing.routes {
            match pattern.strip_suffix('*') {
                Some(prefix) => wildcards.push((prefix.to_string(), provider.clone())),
                None => {
                    exact.insert(pattern.clone(), provider.clone());
                }
            }
        }
        wildcards.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self {
            exact,
            wildcards,
            default_provider: routing.default_provider.clone(),
            configured: configured_providers.to_vec(),
        }
    }

    /// Resolve a model name to a configured provider name.
    pub fn resolve(&self, model: &str) -> Result<String, ApiError> {
        if let Some(provider) = self.exact.get(model) {
            return Ok(provider.clone());
        }

        for (prefix, provider) in &self.wildcards {
            if model.starts_with(prefix.as_str()) {
                return Ok(provider.clone());
            }
        }

        for (prefix, provider) in FAMILY_PREFIXES {
            if model.starts_with(prefix) && self.configured.iter().any(|p| p == provider) {
                return Ok((*provider).to_string());
            }
        }

        if let Some(default) = &self.default_provider {
            return Ok(default.clone());
        }

        Err(ApiError::bad_request(format!(
            "no provider configured for model '{}'",
            model
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(routes: &[(&str, &str)], default: Option<&str>, configured: &[&str]) -> ModelRouter {
        let routing = RoutingConfig {
            routes: routes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            default_provider: default.map(String::from),
        };
        let configured: Vec<String> = configured.iter().map(|s| s.to_string()).collect();
        ModelRouter::from_config(&routing, &configured)
    }

    #[test]
    fn exact_route_wins() {
        let r = router(
            &[("gpt-4o-mini", "groq")],
            Some("openai"),
            &["openai", "groq"],
        );
        assert_eq!(r.resolve("gpt-4o-mini").unwrap(), "groq");
    }

    #[test]
    fn longest_wildcard_prefix_wins() {
        let r = router(
            &[("llama*", "groq"), ("llama-3.3*", "openai")],
            None,
            &["openai", "groq"],
        );
        assert_eq!(r.resolve("llama-3.3-70b-versatile").unwrap(), "openai");
        assert_eq!(r.resolve("llama-3.1-8b").unwrap(), "groq");
    }

    #[test]
    fn family_prefix_overrides_the_default() {
        let r = router(&[], Some("openai"), &["openai", "anthropic"]);
        assert_eq!(r.resolve("claude-3-5-sonnet-latest").unwrap(), "anthropic");
    }

    #[test]
    fn family_prefix_requires_a_configured_provider() {
        // anthropic is not configured, so claude falls through to the default.
        let r = router(&[], Some("openai"), &["openai"]);
        assert_eq!(r.resolve("claude-3-5-sonnet-latest").unwrap(), "openai");
    }

    #[test]
    fn unknown_model_routes_to_default() {
        let r = router(&[], Some("openai"), &["openai"]);
        assert_eq!(r.resolve("entirely-unknown-model").unwrap(), "openai");
    }

    #[test]
    fn no_route_and_no_default_is_bad_request() {
        let r = router(&[], None, &["openai"]);
        assert!(r.resolve("entirely-unknown-model").is_err());
    }
}
