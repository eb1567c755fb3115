use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Prompt for a legacy completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CompletionPrompt {
    Text(String),
    TextArray(Vec<String>),
}

impl CompletionPrompt {
    /// Flatten the prompt into a single text blob for hashing and embedding.
    pub fn as_text(&self) -> String {
        match self {
            CompletionPrompt::Text(t) => t.clone(),
            CompletionPrompt::TextArray(parts) => parts.join("\n"),
        }
    }
}

/// Stop sequence(s)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CompletionStop {
    Single(String),
    Multiple(Vec<String>),
}

/// Create text completion request (OpenAI-compatible, legacy endpoint)
#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
pub struct CreateCompletionPayload {
    /// The prompt to generate completions for
    pub prompt: CompletionPrompt,

    /// Model to use for completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Echo the prompt in the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo: Option<bool>,

    /// Penalize repeated tokens (-2.0 to 2.0)
    #[validate(range(min = -2.0, max = 2.0))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,

    /// Token bias map
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<HashMap<String, f64>>,

    /// Number of log probabilities to return
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<i64>,

    /// Maximum tokens to generate
    #[validate(range(min = 1))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,

    /// Number of completions to generate
    #[validate(range(min = 1))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,

    /// Penalize new topics (-2.0 to 2.0)
    #[validate(range(min = -2.0, max = 2.0))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,

    /// Random seed for reproducibility
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,

    /// Stop sequence(s)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<CompletionStop>,

    /// Enable streaming
    #[serde(default)]
    pub stream: bool,

    /// Text to append after completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,

    /// Sampling temperature (0.0 to 2.0)
    #[validate(range(min = 0.0, max = 2.0))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Nucleus sampling probability (0.0 to 1.0)
    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    /// User identifier for abuse detection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_forms_flatten_to_text() {
        let single = CompletionPrompt::Text("once upon a time".into());
        assert_eq!(single.as_text(), "once upon a time");

        let many = CompletionPrompt::TextArray(vec!["a".into(), "b".into()]);
        assert_eq!(many.as_text(), "a\nb");
    }

    #[test]
    fn deserializes_string_and_array_prompts() {
        let p: CreateCompletionPayload =
            serde_json::from_str(r#"{"model":"gpt-3.5-turbo-instruct","prompt":"hi"}"#).unwrap();
        assert!(matches!(p.prompt, CompletionPrompt::Text(_)));

        let p: CreateCompletionPayload =
            serde_json::from_str(r#"{"model":"m","prompt":["a","b"]}"#).unwrap();
        assert!(matches!(p.prompt, CompletionPrompt::TextArray(_)));
    }
}
