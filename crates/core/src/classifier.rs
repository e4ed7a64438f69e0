use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on the completion the service may return for one verdict.
pub const MAX_COMPLETION_TOKENS: u32 = 150;
/// Anything longer than this is not one of the two verdict shapes.
pub const MAX_RESPONSE_BYTES: usize = 2048;
pub const MAX_NAME_WORDS: usize = 4;

/// Result of classifying one utterance.
///
/// `Failed` means "no verdict". It is never treated as clean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationOutcome {
    Clean,
    Flagged { name: String, reasoning: String },
    Failed { reason: String },
}

// Anything that can judge a single utterance. The pipeline only depends on
// this trait, so tests swap in `MockClassifier` or a scripted fake and never
// touch the network.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait Classifier: Send + Sync {
    /// `utterance` is trimmed and non-empty; the pipeline filters blanks out.
    async fn classify(&self, utterance: &str) -> ClassificationOutcome;
}

#[derive(Debug, thiserror::Error)]
pub enum VerdictError {
    #[error("response is {0} bytes, over the {max} byte limit", max = MAX_RESPONSE_BYTES)]
    Oversized(usize),
    #[error("response is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unexpected verdict shape: {0}")]
    Shape(String),
}

#[derive(Debug, thiserror::Error)]
enum ClassifyError {
    #[error("classifier request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("classifier returned no choices")]
    EmptyResponse,
    #[error(transparent)]
    Verdict(#[from] VerdictError),
}

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub content: String,
}

pub struct ClassifierClient {
    client: Client,
    endpoint: String,
    api_key: SecretString,
    model: String,
}

impl ClassifierClient {
    pub fn new(
        api_key: SecretString,
        model: String,
        endpoint: String,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            model,
        })
    }

    async fn request_verdict(&self, utterance: &str) -> Result<ClassificationOutcome, ClassifyError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "user", "content": build_prompt(utterance) }
            ],
            "response_format": { "type": "json_object" },
            "max_tokens": MAX_COMPLETION_TOKENS,
            "temperature": 0.0
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<LlmResponse>()
            .await?;

        let answer = &resp
            .choices
            .first()
            .ok_or(ClassifyError::EmptyResponse)?
            .message
            .content;

        Ok(parse_verdict(answer)?)
    }
}

#[async_trait]
impl Classifier for ClassifierClient {
    async fn classify(&self, utterance: &str) -> ClassificationOutcome {
        match self.request_verdict(utterance).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Classification failed: {e}");
                ClassificationOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Stand-in used when no API key is configured. Makes no network calls and
/// calls every utterance clean, so the rest of the service can be exercised.
pub struct OfflineClassifier;

#[async_trait]
impl Classifier for OfflineClassifier {
    async fn classify(&self, utterance: &str) -> ClassificationOutcome {
        tracing::debug!("Offline classifier skipping: \"{utterance}\"");
        ClassificationOutcome::Clean
    }
}

pub fn build_prompt(utterance: &str) -> String {
    format!(
        r#"You are monitoring a live conversation for logical fallacies.

Decide whether the following single utterance contains a logical fallacy
(for example: straw man, ad hominem, false dilemma, slippery slope, appeal to
authority, hasty generalization, red herring, circular reasoning).
Only flag clear cases. Ordinary opinions, questions and small talk are not fallacies.

Utterance:
---
{utterance}
---

Respond STRICTLY as one JSON object, in exactly one of these two forms:
{{"fallacy": false}}
{{"fallacy": true, "name": "<fallacy name, at most 4 words>", "reasoning": "<one short sentence>"}}

Do NOT add any other keys or any text outside the JSON."#
    )
}

/// Parses the raw completion text into `Clean` or `Flagged`.
///
/// Incidental code fences around the JSON are stripped first. Everything
/// that is not one of the two accepted shapes is an error.
pub fn parse_verdict(raw: &str) -> Result<ClassificationOutcome, VerdictError> {
    if raw.len() > MAX_RESPONSE_BYTES {
        return Err(VerdictError::Oversized(raw.len()));
    }

    let value: Value = serde_json::from_str(strip_code_fences(raw))?;
    let obj = value
        .as_object()
        .ok_or_else(|| VerdictError::Shape(format!("expected a JSON object, got {value}")))?;

    if let Some(key) = obj
        .keys()
        .find(|k| !matches!(k.as_str(), "fallacy" | "name" | "reasoning"))
    {
        return Err(VerdictError::Shape(format!("unexpected key `{key}`")));
    }

    let fallacy = obj
        .get("fallacy")
        .and_then(Value::as_bool)
        .ok_or_else(|| VerdictError::Shape("`fallacy` must be a boolean".to_string()))?;

    if !fallacy {
        // Models like to echo the empty fields back as null; anything else is not the clean shape.
        let carries_detail = ["name", "reasoning"]
            .iter()
            .any(|k| obj.get(*k).is_some_and(|v| !v.is_null()));
        if carries_detail {
            return Err(VerdictError::Shape(
                "a clean verdict must not carry a name or reasoning".to_string(),
            ));
        }
        return Ok(ClassificationOutcome::Clean);
    }

    let name = required_text(obj, "name")?;
    let words = name.split_whitespace().count();
    if words > MAX_NAME_WORDS {
        return Err(VerdictError::Shape(format!(
            "fallacy name has {words} words, at most {MAX_NAME_WORDS} allowed"
        )));
    }
    let reasoning = required_text(obj, "reasoning")?;

    Ok(ClassificationOutcome::Flagged { name, reasoning })
}

fn required_text(obj: &Map<String, Value>, key: &str) -> Result<String, VerdictError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| VerdictError::Shape(format!("`{key}` must be a non-empty string")))
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag, e.g. ```json
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}
