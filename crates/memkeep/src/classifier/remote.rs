//! Remote classifier using OpenAI-compatible APIs
//!
//! Serves gate routing, sensitivity review and identity summaries through
//! any chat-completions endpoint with a configurable URL, model and API key.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classifier::prompts::{
    EXTRACTION_PROMPT, GATE_PROMPT, SENSITIVITY_PROMPT, SUMMARY_PROMPT,
};
use crate::classifier::provider::{Classifier, Summarizer};
use crate::classifier::types::{
    ClassifierError, ExtractedMemory, GateHints, GateVerdict, SensitivityVerdict,
};
use crate::config::ClassifierConfig;
use crate::memory::types::{Gate, Sensitivity};

/// Remote classifier using OpenAI-compatible HTTP APIs
#[derive(Debug)]
pub struct RemoteClassifier {
    client: Client,
    config: ClassifierConfig,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct GateJson {
    gate: String,
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct SensitivityJson {
    level: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExtractionJson {
    Wrapped { memories: Vec<ExtractedMemory> },
    Bare(Vec<ExtractedMemory>),
}

impl ExtractionJson {
    fn into_memories(self) -> Vec<ExtractedMemory> {
        match self {
            ExtractionJson::Wrapped { memories } | ExtractionJson::Bare(memories) => memories,
        }
    }
}

impl RemoteClassifier {
    /// Create a classifier reading the API key from `config.api_key_env`.
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifierError> {
        let api_key = config.api_key().ok_or_else(|| {
            ClassifierError::Config(format!(
                "API key env var '{}' not set",
                config.api_key_env
            ))
        })?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(
        config: &ClassifierConfig,
        api_key: impl Into<String>,
    ) -> Result<Self, ClassifierError> {
        if config.api_url.trim().is_empty() {
            return Err(ClassifierError::Config("classifier.api_url is empty".to_string()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ClassifierError::Api(e.to_string()))?;

        info!(
            "RemoteClassifier initialized with model: {}, api_url: {}",
            config.model, config.api_url
        );

        Ok(Self {
            client,
            config: config.clone(),
            api_key: api_key.into(),
        })
    }

    /// Call the completions endpoint, backing off 1s, 2s, 4s on rate limits
    /// and transport failures.
    async fn call_api(&self, prompt: &str, max_tokens: u32) -> Result<String, ClassifierError> {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: "You are a precise classification assistant. Follow the output format exactly.".to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: 0.0,
            max_tokens,
        };

        debug!("Calling classifier API at: {}", self.config.api_url);

        let attempts = self.config.max_retries + 1;
        let mut last_error = None;
        let mut delay = Duration::from_secs(1);

        for attempt in 0..attempts {
            match self
                .client
                .post(&self.config.api_url)
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();

                    if status == 429 {
                        warn!(
                            "Rate limited on attempt {}/{}, waiting {:?}",
                            attempt + 1,
                            attempts,
                            delay
                        );
                        last_error = Some("rate limited".to_string());
                        if attempt + 1 < attempts {
                            tokio::time::sleep(delay).await;
                            delay *= 2;
                        }
                        continue;
                    }

                    if !status.is_success() {
                        let error_text = response
                            .text()
                            .await
                            .unwrap_or_else(|_| "Unknown error".to_string());
                        return Err(ClassifierError::Api(format!(
                            "API returned {status}: {error_text}"
                        )));
                    }

                    let completion: ChatCompletionResponse = response
                        .json()
                        .await
                        .map_err(|e| ClassifierError::Parse(e.to_string()))?;

                    return completion
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .ok_or_else(|| ClassifierError::Api("Empty response".to_string()));
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    last_error = Some(err_msg.clone());
                    if attempt + 1 < attempts {
                        warn!(
                            "Request failed on attempt {}/{}, retrying: {}",
                            attempt + 1,
                            attempts,
                            err_msg
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(ClassifierError::Api(format!(
            "Failed after {} attempts: {}",
            attempts,
            last_error.unwrap_or_else(|| "Unknown error".to_string())
        )))
    }
}

/// Parse the first JSON object in a model response.
fn parse_json_object<T: DeserializeOwned>(text: &str) -> Result<T, ClassifierError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&trimmed[start..=end])
            .map_err(|e| ClassifierError::Parse(format!("{e}: {trimmed}"))),
        _ => Err(ClassifierError::Parse(format!("no JSON object in: {trimmed}"))),
    }
}

/// Parse an extraction reply, wrapped in `{"memories": [...]}` or bare.
fn parse_extraction(text: &str) -> Result<Vec<ExtractedMemory>, ClassifierError> {
    let trimmed = text.trim();
    if let Ok(parsed) = serde_json::from_str::<ExtractionJson>(trimmed) {
        return Ok(parsed.into_memories());
    }
    if let Ok(parsed) = parse_json_object::<ExtractionJson>(trimmed) {
        return Ok(parsed.into_memories());
    }
    match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str::<Vec<ExtractedMemory>>(&trimmed[start..=end])
                .map_err(|e| ClassifierError::Parse(format!("{e}: {trimmed}")))
        }
        _ => Err(ClassifierError::Parse(format!("no memories in: {trimmed}"))),
    }
}

fn format_hints(hints: &GateHints) -> String {
    let mut parts = Vec::new();
    if let Some(person) = &hints.person {
        parts.push(format!("person={person}"));
    }
    if let Some(project) = &hints.project {
        parts.push(format!("project={project}"));
    }
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(", ")
    }
}

#[async_trait]
impl Classifier for RemoteClassifier {
    async fn classify_gate(
        &self,
        content: &str,
        hints: &GateHints,
    ) -> Result<GateVerdict, ClassifierError> {
        let prompt = GATE_PROMPT
            .replace("{hints}", &format_hints(hints))
            .replace("{content}", content);
        let response = self.call_api(&prompt, 64).await?;
        debug!("Gate response: {}", response);

        let parsed: GateJson = parse_json_object(&response)?;
        let gate: Gate = parsed
            .gate
            .parse()
            .map_err(|_| ClassifierError::Parse(format!("unknown gate '{}'", parsed.gate)))?;
        Ok(GateVerdict {
            gate,
            confidence: parsed.confidence.clamp(5.0, 95.0),
            signals: vec![format!("model:{}", self.config.model)],
        })
    }

    async fn classify_sensitivity(
        &self,
        content: &str,
    ) -> Result<SensitivityVerdict, ClassifierError> {
        let prompt = SENSITIVITY_PROMPT.replace("{content}", content);
        let response = self.call_api(&prompt, 128).await?;
        debug!("Sensitivity response: {}", response);

        let parsed: SensitivityJson = parse_json_object(&response)?;
        let level = match parsed.level.trim().to_ascii_lowercase().as_str() {
            "safe" => Sensitivity::Safe,
            "sensitive" => Sensitivity::Sensitive,
            "critical" => Sensitivity::Critical,
            other => {
                return Err(ClassifierError::Parse(format!(
                    "unknown sensitivity level '{other}'"
                )));
            }
        };
        let reason = if parsed.reason.trim().is_empty() {
            format!("classified {} by {}", level.as_str(), self.config.model)
        } else {
            parsed.reason
        };
        Ok(SensitivityVerdict::new(level, reason))
    }

    async fn extract_memories(
        &self,
        transcript: &str,
    ) -> Result<Vec<ExtractedMemory>, ClassifierError> {
        let prompt = EXTRACTION_PROMPT.replace("{transcript}", transcript);
        let response = self.call_api(&prompt, 1024).await?;
        debug!("Extraction response: {}", response);
        let memories: Vec<ExtractedMemory> = parse_extraction(&response)?
            .into_iter()
            .filter(|m| !m.content.trim().is_empty())
            .collect();
        debug!("Extracted {} candidate memories", memories.len());
        Ok(memories)
    }

    async fn is_available(&self) -> bool {
        !self.api_key.is_empty() && !self.config.api_url.is_empty()
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

#[async_trait]
impl Summarizer for RemoteClassifier {
    async fn summarize(&self, heading: &str, items: &[String]) -> Result<String, ClassifierError> {
        let list = items
            .iter()
            .map(|i| format!("- {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = SUMMARY_PROMPT
            .replace("{heading}", heading)
            .replace("{items}", &list);
        let response = self.call_api(&prompt, 512).await?;
        let text = response.trim();
        if text.is_empty() {
            return Err(ClassifierError::Parse("empty summary".to_string()));
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_config(api_url: String) -> ClassifierConfig {
        ClassifierConfig {
            api_url,
            api_key_env: "MEMKEEP_TEST_UNSET_KEY".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 5,
            max_retries: 0,
        }
    }

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{ "message": { "content": content } }]
        })
    }

    async fn mock_reply(content: &str) -> (MockServer, RemoteClassifier) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(content)))
            .mount(&server)
            .await;
        let config = create_test_config(format!("{}/v1/chat/completions", server.uri()));
        let classifier = RemoteClassifier::with_api_key(&config, "test-key").unwrap();
        (server, classifier)
    }

    #[test]
    fn test_new_missing_api_key() {
        let config = create_test_config("https://api.example.com/v1/chat/completions".into());
        let err = RemoteClassifier::new(&config).unwrap_err().to_string();
        assert!(err.contains("MEMKEEP_TEST_UNSET_KEY"));
    }

    #[test]
    fn test_parse_json_with_surrounding_text() {
        let parsed: GateJson =
            parse_json_object("Sure! {\"gate\": \"behavioral\", \"confidence\": 80} done").unwrap();
        assert_eq!(parsed.gate, "behavioral");
        assert!(parse_json_object::<GateJson>("no json here").is_err());
    }

    #[tokio::test]
    async fn test_classify_gate() {
        let (_server, classifier) =
            mock_reply(r#"{"gate": "relational", "confidence": 88}"#).await;
        let verdict = classifier
            .classify_gate("Alice is my manager", &GateHints::default())
            .await
            .unwrap();
        assert_eq!(verdict.gate, Gate::Relational);
        assert_eq!(verdict.confidence, 88.0);
    }

    #[tokio::test]
    async fn test_gate_confidence_is_clamped() {
        let (_server, classifier) = mock_reply(r#"{"gate": "epistemic", "confidence": 100}"#).await;
        let verdict = classifier
            .classify_gate("water boils at 100C", &GateHints::default())
            .await
            .unwrap();
        assert!(verdict.confidence < 100.0);
    }

    #[tokio::test]
    async fn test_unknown_gate_is_parse_error() {
        let (_server, classifier) = mock_reply(r#"{"gate": "vibes", "confidence": 70}"#).await;
        let err = classifier
            .classify_gate("whatever", &GateHints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifierError::Parse(_)));
    }

    #[tokio::test]
    async fn test_classify_sensitivity() {
        let (_server, classifier) =
            mock_reply(r#"{"level": "sensitive", "reason": "mentions a health condition"}"#).await;
        let verdict = classifier
            .classify_sensitivity("I was diagnosed with asthma")
            .await
            .unwrap();
        assert_eq!(verdict.level, Sensitivity::Sensitive);
        assert_eq!(verdict.reason, "mentions a health condition");
    }

    #[tokio::test]
    async fn test_server_error_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("quota exceeded"))
            .mount(&server)
            .await;
        let classifier =
            RemoteClassifier::with_api_key(&create_test_config(server.uri()), "test-key").unwrap();
        let err = classifier.classify_sensitivity("hello").await.unwrap_err();
        assert!(matches!(err, ClassifierError::Api(_)));
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn test_parse_extraction_shapes() {
        let wrapped = parse_extraction(
            r#"{"memories": [{"content": "prefers tabs", "gate": "behavioral", "person": null}]}"#,
        )
        .unwrap();
        assert_eq!(wrapped, vec![ExtractedMemory::new("prefers tabs").with_gate("behavioral")]);

        let bare = parse_extraction(r#"Here you go: [{"content": "Dana leads infra"}]"#).unwrap();
        assert_eq!(bare, vec![ExtractedMemory::new("Dana leads infra")]);

        assert!(parse_extraction(r#"{"memories": []}"#).unwrap().is_empty());
        assert!(parse_extraction("nothing to report").is_err());
    }

    #[tokio::test]
    async fn test_extract_memories_drops_blank_entries() {
        let (_server, classifier) = mock_reply(
            r#"{"memories": [{"content": "Dana leads infra", "gate": "relational", "person": "Dana"}, {"content": "  "}]}"#,
        )
        .await;
        let memories = classifier
            .extract_memories("user: Dana leads infra now")
            .await
            .unwrap();
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].person.as_deref(), Some("Dana"));
    }

    #[tokio::test]
    async fn test_summarize() {
        let (_server, classifier) = mock_reply("  Prefers dark mode and vim.  ").await;
        let summary = classifier
            .summarize(
                "Preferences & habits",
                &["prefers dark mode".to_string(), "uses vim".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(summary, "Prefers dark mode and vim.");
    }
}
