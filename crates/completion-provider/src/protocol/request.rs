//! Completion request bodies carried in job args

use super::Usage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A prompt-style or chat-style completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestBody {
    Completion(CompletionRequest),
    Chat(ChatCompletionRequest),
}

/// `/completions` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: Prompt,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Remaining parameters, forwarded upstream untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Text(String),
    Texts(Vec<String>),
    Tokens(Vec<u32>),
    TokenBatches(Vec<Vec<u32>>),
}

/// `/chat/completions` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    Developer,
    User,
    Assistant,
    Tool,
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
}

impl RequestBody {
    /// Parse and validate job args.
    ///
    /// The returned message is suitable for an `InvalidJobArgs` rejection.
    pub fn parse(args: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(args)
            .map_err(|e| format!("Failed to parse job args as JSON: {}", e))?;

        let body = if value.get("prompt").is_some() {
            serde_json::from_value(value).map(RequestBody::Completion)
        } else {
            serde_json::from_value(value).map(RequestBody::Chat)
        }
        .map_err(|e| format!("Invalid request body: {}", e))?;

        body.validate()?;
        Ok(body)
    }

    fn validate(&self) -> Result<(), String> {
        if self.model().is_empty() {
            return Err("Invalid request body: model must not be empty".to_string());
        }

        let (temperature, top_p, frequency_penalty, presence_penalty, n) = match self {
            RequestBody::Completion(r) => {
                if prompt_is_empty(&r.prompt) {
                    return Err("Invalid request body: prompt must not be empty".to_string());
                }
                (r.temperature, r.top_p, r.frequency_penalty, r.presence_penalty, r.n)
            }
            RequestBody::Chat(r) => {
                if r.messages.is_empty() {
                    return Err("Invalid request body: messages must not be empty".to_string());
                }
                (r.temperature, r.top_p, r.frequency_penalty, r.presence_penalty, r.n)
            }
        };

        check_range("temperature", temperature, 0.0, 2.0)?;
        check_range("top_p", top_p, 0.0, 1.0)?;
        check_range("frequency_penalty", frequency_penalty, -2.0, 2.0)?;
        check_range("presence_penalty", presence_penalty, -2.0, 2.0)?;
        if n == Some(0) {
            return Err("Invalid request body: n must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn model(&self) -> &str {
        match self {
            RequestBody::Completion(r) => &r.model,
            RequestBody::Chat(r) => &r.model,
        }
    }

    /// Whether the job streams; an absent `stream` means non-streaming
    pub fn is_streaming(&self) -> bool {
        match self {
            RequestBody::Completion(r) => r.stream,
            RequestBody::Chat(r) => r.stream,
        }
        .unwrap_or(false)
    }

    /// Upstream endpoint path, relative to the API base URL
    pub fn endpoint(&self) -> &'static str {
        match self {
            RequestBody::Completion(_) => "/completions",
            RequestBody::Chat(_) => "/chat/completions",
        }
    }

    /// Request payload for the upstream API.
    ///
    /// `stream` is forced to the given mode; streaming requests always ask for
    /// trailing usage.
    pub fn upstream_payload(&self, stream: bool) -> Result<Value, serde_json::Error> {
        let mut payload = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut payload {
            map.insert("stream".to_string(), Value::Bool(stream));
            if stream {
                map.insert(
                    "stream_options".to_string(),
                    serde_json::json!({ "include_usage": true }),
                );
            } else {
                map.remove("stream_options");
            }
        }
        Ok(payload)
    }

    /// Allow-listed request parameters for the public payload
    pub fn public_request(&self) -> PublicRequest {
        match self {
            RequestBody::Completion(r) => PublicRequest {
                model: r.model.clone(),
                frequency_penalty: r.frequency_penalty,
                max_tokens: r.max_tokens,
                n: r.n,
                presence_penalty: r.presence_penalty,
                stream: r.stream,
                temperature: r.temperature,
                top_p: r.top_p,
                ..PublicRequest::default()
            },
            RequestBody::Chat(r) => PublicRequest {
                model: r.model.clone(),
                store: r.store,
                reasoning_effort: r.reasoning_effort,
                frequency_penalty: r.frequency_penalty,
                max_tokens: r.max_tokens,
                max_completion_tokens: r.max_completion_tokens,
                n: r.n,
                presence_penalty: r.presence_penalty,
                response_format: r
                    .response_format
                    .as_ref()
                    .and_then(|f| f.get("type"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                stream: r.stream,
                temperature: r.temperature,
                top_p: r.top_p,
            },
        }
    }
}

fn prompt_is_empty(prompt: &Prompt) -> bool {
    match prompt {
        Prompt::Text(_) => false,
        Prompt::Texts(v) => v.is_empty(),
        Prompt::Tokens(v) => v.is_empty(),
        Prompt::TokenBatches(v) => v.is_empty(),
    }
}

fn check_range(name: &str, value: Option<f64>, min: f64, max: f64) -> Result<(), String> {
    match value {
        Some(v) if !(min..=max).contains(&v) => Err(format!(
            "Invalid request body: {} must be between {} and {}",
            name, min, max
        )),
        _ => Ok(()),
    }
}

/// Request parameters that are safe to publish. Never message or prompt content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    /// Only the format type, never an embedded schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicResponse {
    pub usage: Usage,
}

/// Redacted billing summary attached to a completed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicJobPayload {
    pub request: PublicRequest,
    pub response: PublicResponse,
}

impl PublicJobPayload {
    pub fn new(body: &RequestBody, usage: Usage) -> Self {
        Self {
            request: body.public_request(),
            response: PublicResponse { usage },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prompt_takes_precedence() {
        let body = RequestBody::parse(
            r#"{"model": "m", "prompt": "Say hi", "messages": [{"role": "user", "content": "x"}]}"#,
        )
        .unwrap();
        assert!(matches!(body, RequestBody::Completion(_)));
        assert_eq!(body.endpoint(), "/completions");
    }

    #[test]
    fn test_parse_chat() {
        let body = RequestBody::parse(
            r#"{"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "Hello"}], "stream": true}"#,
        )
        .unwrap();
        assert_eq!(body.model(), "gpt-4o-mini");
        assert!(body.is_streaming());
        assert_eq!(body.endpoint(), "/chat/completions");
    }

    #[test]
    fn test_stream_defaults_to_false() {
        let body = RequestBody::parse(r#"{"model": "m", "prompt": ["a", "b"]}"#).unwrap();
        assert!(!body.is_streaming());
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(RequestBody::parse("not json").unwrap_err().contains("JSON"));
        assert!(RequestBody::parse(r#"{"messages": []}"#).is_err());
        assert!(RequestBody::parse(r#"{"model": "m", "messages": []}"#).is_err());
        assert!(
            RequestBody::parse(r#"{"model": "m", "messages": [{"role": "wizard"}]}"#).is_err()
        );
        assert!(RequestBody::parse(r#"{"model": "", "prompt": "x"}"#).is_err());
        assert!(RequestBody::parse(r#"{"model": "m", "prompt": "x", "temperature": 3}"#).is_err());
        assert!(RequestBody::parse(r#"{"model": "m", "prompt": "x", "n": 0}"#).is_err());
    }

    #[test]
    fn test_upstream_payload_forces_stream_mode() {
        let body = RequestBody::parse(
            r#"{"model": "m", "messages": [{"role": "user", "content": "Hi"}], "stream": true, "seed": 7}"#,
        )
        .unwrap();

        let payload = body.upstream_payload(true).unwrap();
        assert_eq!(payload["stream"], json!(true));
        assert_eq!(payload["stream_options"], json!({"include_usage": true}));
        assert_eq!(payload["seed"], json!(7));

        let payload = body.upstream_payload(false).unwrap();
        assert_eq!(payload["stream"], json!(false));
        assert!(payload.get("stream_options").is_none());
    }

    #[test]
    fn test_public_payload_excludes_content() {
        let body = RequestBody::parse(
            r#"{
                "model": "gpt-4o-mini",
                "messages": [{"role": "system", "content": "secret instructions"}],
                "temperature": 0.5,
                "response_format": {"type": "json_schema", "json_schema": {"name": "private"}},
                "user": "alice"
            }"#,
        )
        .unwrap();

        let usage = Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        };
        let public = serde_json::to_string(&PublicJobPayload::new(&body, usage)).unwrap();

        assert!(!public.contains("secret"));
        assert!(!public.contains("alice"));
        assert!(!public.contains("private"));
        assert!(public.contains("json_schema"));

        let value: Value = serde_json::from_str(&public).unwrap();
        assert_eq!(value["request"]["model"], "gpt-4o-mini");
        assert_eq!(value["request"]["temperature"], 0.5);
        assert_eq!(value["response"]["usage"]["completion_tokens"], 5);
    }
}
