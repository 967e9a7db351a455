//! Shared types for the page analysis service and its stream/RPC clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =====================================================
// Session Lifecycle
// =====================================================

/// Lifecycle status of an analysis session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    /// Completed and Failed never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which analysis stage a session drives its items through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Screenshot understanding: one UI element inventory per image
    PageAnalysis,
    /// Test-scenario generation from an optional screenshot plus a description
    TestScenarios,
    /// Automation scripts for a set of scenarios, one item per output format
    ScriptGeneration,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::PageAnalysis => "page_analysis",
            JobKind::TestScenarios => "test_scenarios",
            JobKind::ScriptGeneration => "script_generation",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shared descriptive context submitted alongside a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    pub page_name: Option<String>,
    pub page_url: Option<String>,
    pub description: Option<String>,
    /// Required for test-scenario sessions
    pub test_description: Option<String>,
    pub additional_context: Option<String>,
    #[serde(default)]
    pub generate_formats: Vec<String>,
    /// Input of script-generation sessions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_scenarios: Vec<TestScenario>,
}

// =====================================================
// Normalized Analysis Output
// =====================================================

/// A single UI element recognized on a page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UiElement {
    pub id: String,
    pub name: String,
    pub element_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_hint: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_features: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub functionality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
}

/// How the normalizer arrived at a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    /// `{"title", "description", "elements"}`
    Structured,
    /// `{"<page name>": [{"description": ..}, ...elements]}`
    Legacy,
    /// JSON object of unknown shape; elements taken from its first non-empty array
    Unrecognized,
    /// No usable JSON; one element per non-blank line
    TextFallback,
    /// The item's analysis failed
    Failed,
}

/// Normalized page analysis for one screenshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub title: String,
    pub description: String,
    pub elements: Vec<UiElement>,
    pub confidence: f64,
    pub parse_mode: ParseMode,
    /// Original structured payload, kept for audit
    pub raw_source: Value,
}

/// One suggested test scenario
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestScenario {
    pub scenario_id: String,
    pub scenario_name: String,
    pub description: String,
    pub category: String,
    pub priority: String,
    pub estimated_duration: String,
    pub preconditions: Vec<String>,
    pub test_steps: Vec<String>,
    pub expected_results: Vec<String>,
    pub test_data: Value,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub total_scenarios: usize,
    pub high_priority: usize,
    pub medium_priority: usize,
    pub low_priority: usize,
    pub categories: Vec<String>,
}

/// Normalized output of the test-scenario stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSet {
    pub scenarios: Vec<TestScenario>,
    pub summary: ScenarioSummary,
    pub confidence: f64,
    /// True when the generator output was unusable and defaults were substituted
    pub degraded: bool,
}

/// One automation script produced for a scenario set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedScript {
    /// `yaml` or `playwright`
    pub format: String,
    pub file_name: String,
    pub content: String,
    pub scenario_count: usize,
    pub confidence: f64,
    /// True when the generator produced no usable script body
    pub degraded: bool,
}

/// Per-item result slot in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemResult {
    Page(AnalysisRecord),
    Scenarios(ScenarioSet),
    Script(GeneratedScript),
}

impl ItemResult {
    pub fn confidence(&self) -> f64 {
        match self {
            ItemResult::Page(record) => record.confidence,
            ItemResult::Scenarios(set) => set.confidence,
            ItemResult::Script(script) => script.confidence,
        }
    }

    /// Number of elements (page) or scenarios (test and script generation)
    pub fn entry_count(&self) -> usize {
        match self {
            ItemResult::Page(record) => record.elements.len(),
            ItemResult::Scenarios(set) => set.scenarios.len(),
            ItemResult::Script(script) => script.scenario_count,
        }
    }
}

/// Aggregate carried by the terminal FinalResult event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_items: usize,
    pub processed_items: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub confidence_scores: Vec<f64>,
    pub average_confidence: f64,
    pub results: Vec<ItemResult>,
}

// =====================================================
// Events
// =====================================================

/// Display region a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Process,
    Analysis,
    Error,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Process => "process",
            Region::Analysis => "analysis",
            Region::Error => "error",
        }
    }
}

/// Event body, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Message {
        content: String,
        region: Region,
    },
    Progress {
        content: String,
        /// 1-based position of the item about to be analyzed
        index: usize,
        total: usize,
        percent: u8,
    },
    Error {
        content: String,
        error: String,
    },
    FinalResult {
        content: String,
        result: BatchSummary,
    },
}

impl EventPayload {
    /// FinalResult and Error always end a session's stream
    pub fn is_final(&self) -> bool {
        matches!(self, EventPayload::Error { .. } | EventPayload::FinalResult { .. })
    }

    pub fn content(&self) -> &str {
        match self {
            EventPayload::Message { content, .. }
            | EventPayload::Progress { content, .. }
            | EventPayload::Error { content, .. }
            | EventPayload::FinalResult { content, .. } => content,
        }
    }

    pub fn region(&self) -> Region {
        match self {
            EventPayload::Message { region, .. } => *region,
            EventPayload::Progress { .. } | EventPayload::FinalResult { .. } => Region::Process,
            EventPayload::Error { .. } => Region::Error,
        }
    }
}

/// One unit of streamed information for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub session_id: String,
    /// Monotonic per session, assigned at enqueue
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub is_final: bool,
    pub source: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

// =====================================================
// RPC Request Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalyzeTextRequest {
    pub test_description: String,
    pub additional_context: Option<String>,
    /// Comma-separated, e.g. "yaml,playwright"
    pub generate_formats: Option<String>,
}

/// Scenarios are taken from `test_scenarios`, or from the results of the
/// scenario session named by `session_id` when the list is empty
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GenerateScriptsRequest {
    pub session_id: Option<String>,
    #[serde(default)]
    pub test_scenarios: Vec<TestScenario>,
    /// Defaults to yaml and playwright
    #[serde(default)]
    pub generate_formats: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeywordSearchRequest {
    #[serde(default)]
    pub keywords: Vec<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PageListQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub search: Option<String>,
}

// =====================================================
// RPC Response Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Returned by every ingress endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub kind: JobKind,
    pub status: SessionStatus,
    pub stream_endpoint: String,
    pub status_endpoint: String,
    pub items: Vec<String>,
}

/// Read-only snapshot served by the status endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub kind: JobKind,
    pub status: SessionStatus,
    pub progress: u8,
    pub total_items: usize,
    pub processed_items: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub context: PageContext,
}

/// A persisted page analysis row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageAnalysisRow {
    pub id: i64,
    pub session_id: String,
    pub item_index: i64,
    pub page_name: String,
    pub page_url: Option<String>,
    pub page_description: String,
    pub confidence_score: f64,
    pub elements_count: i64,
    pub parse_mode: String,
    pub created_at: String,
}

/// A persisted UI element row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageElementRow {
    pub id: i64,
    pub page_analysis_id: i64,
    pub element_name: String,
    pub element_type: String,
    pub element_description: String,
    pub element_data: Option<String>,
    pub confidence_score: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PageAnalysisDetail {
    pub page: PageAnalysisRow,
    pub raw_analysis_json: Option<String>,
    pub elements: Vec<PageElementRow>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PageList {
    pub pages: Vec<PageAnalysisRow>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ElementList {
    pub elements: Vec<PageElementRow>,
    pub total: usize,
}

// =====================================================
// Knowledge Base
// =====================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementTypeCount {
    pub element_type: String,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KnowledgeBaseSummary {
    pub total_pages: usize,
    pub total_elements: usize,
    pub average_confidence: f64,
    /// Most frequent first
    pub element_types: Vec<ElementTypeCount>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeywordSearchResults {
    pub results: Vec<PageAnalysisRow>,
    pub total: usize,
    pub keywords: Vec<String>,
}

// =====================================================
// Service Status
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
    pub uptime_secs: u64,
}
