//! Model collaborator: turns one work item into raw generator text.
//!
//! `ModelClient` speaks the OpenAI-compatible chat completions API. Images
//! travel inline as base64 data URIs.

use crate::config::Config;
use crate::session::WorkItem;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use page_analysis_types::{JobKind, PageContext};
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AnalyzerError {
    pub message: String,
    /// HTTP status code if available
    pub status_code: Option<u16>,
    /// The request never got a response
    pub transport: bool,
}

impl AnalyzerError {
    pub fn new(message: impl Into<String>) -> Self {
        AnalyzerError {
            message: message.into(),
            status_code: None,
            transport: false,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        AnalyzerError {
            message: message.into(),
            status_code: None,
            transport: true,
        }
    }

    pub fn with_status(message: impl Into<String>, status_code: u16) -> Self {
        AnalyzerError {
            message: message.into(),
            status_code: Some(status_code),
            transport: false,
        }
    }

    /// Connection failures, rate limiting and gateway failures are worth
    /// another attempt
    pub fn is_retryable(&self) -> bool {
        self.transport || matches!(self.status_code, Some(429 | 502 | 503 | 504))
    }
}

impl fmt::Display for AnalyzerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.status_code {
            write!(f, "[HTTP {}] {}", code, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for AnalyzerError {}

impl From<String> for AnalyzerError {
    fn from(s: String) -> Self {
        AnalyzerError::new(s)
    }
}

impl From<&str> for AnalyzerError {
    fn from(s: &str) -> Self {
        AnalyzerError::new(s)
    }
}

/// Everything the model needs for one item
pub struct AnalysisRequest<'a> {
    pub kind: JobKind,
    pub index: usize,
    pub item: &'a WorkItem,
    pub context: &'a PageContext,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn invoke(&self, request: AnalysisRequest<'_>) -> Result<String, AnalyzerError>;
}

// =====================================================
// OpenAI-compatible client
// =====================================================

const MAX_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 2000;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Clone)]
pub struct ModelClient {
    client: Client,
    auth_headers: header::HeaderMap,
    endpoint: String,
    vision_model: String,
    scenario_model: String,
    timeout: Duration,
    base_delay: Duration,
}

impl ModelClient {
    pub fn from_config(config: &Config) -> Result<Self, String> {
        let mut auth_headers = header::HeaderMap::new();
        auth_headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(key) = config.model_api_key.as_deref().filter(|k| !k.is_empty()) {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| format!("Invalid MODEL_API_KEY: {}", e))?;
            auth_headers.insert(header::AUTHORIZATION, value);
        }

        Ok(Self {
            client: Client::new(),
            auth_headers,
            endpoint: config.model_endpoint.clone(),
            vision_model: config.vision_model.clone(),
            scenario_model: config.scenario_model.clone(),
            timeout: config.model_timeout,
            base_delay: Duration::from_millis(BASE_DELAY_MS),
        })
    }

    #[cfg(test)]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    fn build_request(&self, request: &AnalysisRequest<'_>) -> ChatRequest {
        let (model, system_prompt, user_text) = match request.kind {
            JobKind::PageAnalysis => (
                &self.vision_model,
                PAGE_ANALYSIS_PROMPT,
                page_user_text(request.item, request.context),
            ),
            JobKind::TestScenarios => (
                &self.scenario_model,
                TEST_SCENARIO_PROMPT,
                scenario_user_text(request.item, request.context),
            ),
            JobKind::ScriptGeneration => (
                &self.scenario_model,
                SCRIPT_GENERATION_PROMPT,
                script_user_text(request.item, request.context),
            ),
        };

        let mut parts = vec![json!({ "type": "text", "text": user_text })];
        if let Some(bytes) = &request.item.image {
            let mime = request.item.content_type.as_deref().unwrap_or("image/png");
            parts.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{};base64,{}", mime, BASE64.encode(bytes)) }
            }));
        }

        ChatRequest {
            model: model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: Value::String(system_prompt.to_string()),
                },
                ChatMessage {
                    role: "user",
                    content: Value::Array(parts),
                },
            ],
            temperature: 0.1,
            stream: false,
        }
    }

    async fn send_once(&self, body: &ChatRequest) -> Result<String, AnalyzerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.auth_headers.clone())
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| AnalyzerError::transport(format!("Model request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ErrorEnvelope>(&error_text) {
                Ok(envelope) => envelope.error.message,
                Err(_) => error_text,
            };
            return Err(AnalyzerError::with_status(message, status.as_u16()));
        }

        let data: ChatResponse = response
            .json()
            .await
            .map_err(|e| AnalyzerError::new(format!("Failed to parse model response: {}", e)))?;

        data.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AnalyzerError::new("Model returned no content"))
    }
}

#[async_trait]
impl Analyzer for ModelClient {
    async fn invoke(&self, request: AnalysisRequest<'_>) -> Result<String, AnalyzerError> {
        let body = self.build_request(&request);
        log::debug!(
            "[ANALYZER] {} item {} ({}) -> {}",
            request.kind,
            request.index,
            request.item.name,
            body.model
        );

        let mut last_error = AnalyzerError::new("Max retries exceeded");
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = self.base_delay * (1 << (attempt - 1));
                log::warn!(
                    "[ANALYZER] Retry attempt {}/{} after {}ms delay",
                    attempt,
                    MAX_RETRIES,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            match self.send_once(&body).await {
                Ok(text) => {
                    if log::log_enabled!(log::Level::Debug) {
                        log::debug!("[ANALYZER] Raw output:\n{}", text);
                    }
                    return Ok(text);
                }
                Err(e) if e.is_retryable() => {
                    log::warn!("[ANALYZER] Attempt {} failed: {}", attempt + 1, e);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }
}

fn page_user_text(item: &WorkItem, context: &PageContext) -> String {
    let mut text = format!("Analyze the page screenshot `{}`.", item.name);
    if let Some(name) = context.page_name.as_deref().filter(|s| !s.is_empty()) {
        text.push_str(&format!("\nPage name: {}", name));
    }
    if let Some(url) = context.page_url.as_deref().filter(|s| !s.is_empty()) {
        text.push_str(&format!("\nPage URL: {}", url));
    }
    if let Some(desc) = context.description.as_deref().filter(|s| !s.is_empty()) {
        text.push_str(&format!("\nUser notes: {}", desc));
    }
    text
}

fn scenario_user_text(item: &WorkItem, context: &PageContext) -> String {
    let mut text = format!(
        "Requirement: {}",
        context.test_description.as_deref().unwrap_or_default()
    );
    if let Some(extra) = context.additional_context.as_deref().filter(|s| !s.is_empty()) {
        text.push_str(&format!("\nAdditional context: {}", extra));
    }
    if !context.generate_formats.is_empty() {
        text.push_str(&format!(
            "\nTarget formats: {}",
            context.generate_formats.join(", ")
        ));
    }
    if item.image.is_some() {
        text.push_str("\nA screenshot of the page under test is attached.");
    }
    text
}

/// The item name is the target format
fn script_user_text(item: &WorkItem, context: &PageContext) -> String {
    let scenarios = serde_json::to_string_pretty(&context.test_scenarios)
        .unwrap_or_else(|_| "[]".to_string());
    let mut text = format!(
        "Target format: {}\nWrite one script covering these {} test scenarios:\n{}",
        item.name,
        context.test_scenarios.len(),
        scenarios
    );
    if let Some(desc) = context.test_description.as_deref().filter(|s| !s.is_empty()) {
        text.push_str(&format!("\nRequirement: {}", desc));
    }
    text
}

const PAGE_ANALYSIS_PROMPT: &str = r#"You are a UI analyst. Identify every visible interactive or informative element on the screenshot.
Respond with JSON only, in exactly this shape:
{
  "title": "short page title",
  "description": "detailed description of the whole page",
  "elements": [
    {
      "id": "element_001",
      "name": "Login button",
      "element_type": "button",
      "description": "blue rounded button at the top right, white text 'Login'",
      "text_content": "Login",
      "position": {"area": "top right", "relative_to": "right of search box"},
      "visual_features": {"color": "blue background, white text", "shape": "rounded rectangle"},
      "functionality": "opens the sign-in form",
      "interaction_state": "clickable",
      "confidence_score": 0.95
    }
  ]
}"#;

const TEST_SCENARIO_PROMPT: &str = r#"You are a QA engineer. Design test scenarios for the described page or feature.
Respond with JSON only, in exactly this shape:
{
  "suggested_test_scenarios": [
    {
      "scenario_id": "TC001",
      "scenario_name": "User can log in",
      "description": "valid credentials reach the dashboard",
      "category": "functional",
      "priority": "high",
      "estimated_duration": "2 minutes",
      "preconditions": ["account exists"],
      "test_steps": ["open login", "enter credentials", "submit"],
      "expected_results": ["dashboard is shown"],
      "test_data": {"username": "test@example.com"},
      "tags": ["login"]
    }
  ]
}
Priority is one of high, medium, low."#;

const SCRIPT_GENERATION_PROMPT: &str = r#"You are a test automation engineer. Turn the given test scenarios into one runnable script.
For format "yaml" write a declarative UI test script with one test case per scenario, listing its steps and assertions.
For format "playwright" write a TypeScript Playwright test file using @playwright/test with one test per scenario.
Reply with the script in a single fenced code block and nothing else."#;
