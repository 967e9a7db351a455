//! Axum route handlers for the page analysis API.

use crate::config::Config;
use crate::db::Db;
use crate::registry::SessionRegistry;
use crate::runner::AnalysisTaskRunner;
use crate::scripts;
use crate::session::{BatchInput, WorkItem};
use crate::stream::{ChannelSink, Frame, StreamConsumer};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{HeaderName, StatusCode, header};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use page_analysis_types::*;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

/// Request bodies may carry this many maximum-size uploads
const MAX_UPLOADS_PER_REQUEST: usize = 20;
const STREAM_BUFFER_FRAMES: usize = 64;
const DEFAULT_RESULT_LIMIT: usize = 20;
const MAX_RESULT_LIMIT: usize = 100;
const MAX_KEYWORDS: usize = 20;

pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub runner: Arc<AnalysisTaskRunner>,
    pub db: Arc<Db>,
    pub config: Config,
    pub start_time: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state
        .config
        .max_upload_bytes
        .saturating_mul(MAX_UPLOADS_PER_REQUEST);

    Router::new()
        .route("/api/health", get(health))
        // Ingress
        .route(
            "/api/v1/web/page-analysis/upload-and-analyze",
            post(upload_and_analyze),
        )
        .route(
            "/api/v1/web/test-case-creation/analyze-image",
            post(analyze_image),
        )
        .route(
            "/api/v1/web/test-case-creation/analyze-text",
            post(analyze_text),
        )
        .route(
            "/api/v1/web/test-case-creation/generate-scripts",
            post(generate_scripts),
        )
        // Sessions
        .route("/api/v1/web/sessions", get(sessions_list))
        .route("/api/v1/web/sessions/:id/status", get(session_status))
        .route("/api/v1/web/sessions/:id/stream", get(session_stream))
        .route("/api/v1/web/sessions/:id", delete(session_delete))
        // Persisted analyses
        .route("/api/v1/web/pages", get(pages_list))
        .route("/api/v1/web/pages/:id", get(page_get).delete(page_delete))
        .route("/api/v1/web/pages/:id/elements", get(page_elements))
        // Knowledge base
        .route("/api/v1/web/knowledge-base/summary", get(knowledge_summary))
        .route(
            "/api/v1/web/knowledge-base/ui-elements/:element_type",
            get(knowledge_elements_by_type),
        )
        .route(
            "/api/v1/web/knowledge-base/search-by-keywords",
            post(knowledge_search_by_keywords),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

fn bad_request<T: Serialize>(msg: impl Into<String>) -> (StatusCode, Json<RpcResponse<T>>) {
    (StatusCode::BAD_REQUEST, Json(RpcResponse::err(msg)))
}

fn not_found<T: Serialize>(msg: impl Into<String>) -> (StatusCode, Json<RpcResponse<T>>) {
    (StatusCode::NOT_FOUND, Json(RpcResponse::err(msg)))
}

// =====================================================
// Service
// =====================================================

// GET /api/health
pub async fn health(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<ServiceStatus>>) {
    (
        StatusCode::OK,
        Json(RpcResponse::ok(ServiceStatus {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            active_sessions: state.registry.len(),
            uptime_secs: state.start_time.elapsed().as_secs(),
        })),
    )
}

// =====================================================
// Ingress
// =====================================================

fn check_image(
    name: &str,
    content_type: Option<&str>,
    len: usize,
    max_bytes: usize,
) -> Result<(), String> {
    if !content_type.is_some_and(|ct| ct.starts_with("image/")) {
        return Err(format!("{} is not an image file", name));
    }
    if len == 0 {
        return Err(format!("{} is empty", name));
    }
    if len > max_bytes {
        return Err(format!(
            "{} exceeds the {} MB upload limit",
            name,
            max_bytes / (1024 * 1024)
        ));
    }
    Ok(())
}

/// Read one uploaded file field into a validated work item
async fn read_image_field(
    field: axum::extract::multipart::Field<'_>,
    fallback_name: String,
    max_bytes: usize,
) -> Result<WorkItem, String> {
    let name = field
        .file_name()
        .map(|s| s.to_string())
        .unwrap_or(fallback_name);
    let content_type = field.content_type().map(|s| s.to_string());
    let bytes = field
        .bytes()
        .await
        .map_err(|e| format!("Failed to read {}: {}", name, e))?;
    check_image(&name, content_type.as_deref(), bytes.len(), max_bytes)?;
    Ok(WorkItem::image(
        name,
        content_type.unwrap_or_default(),
        bytes.to_vec(),
    ))
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_formats(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn result_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_RESULT_LIMIT).clamp(1, MAX_RESULT_LIMIT)
}

/// Requested script formats, lowercased and deduplicated; empty means all
fn script_formats(requested: &[String]) -> Result<Vec<String>, String> {
    let mut formats: Vec<String> = Vec::new();
    for format in requested.iter().map(|f| f.trim().to_lowercase()) {
        if format.is_empty() || formats.contains(&format) {
            continue;
        }
        if !scripts::is_supported(&format) {
            return Err(format!(
                "Unsupported script format '{}', expected one of: {}",
                format,
                scripts::SUPPORTED_FORMATS.join(", ")
            ));
        }
        formats.push(format);
    }
    if formats.is_empty() {
        formats = scripts::SUPPORTED_FORMATS.iter().map(|f| f.to_string()).collect();
    }
    Ok(formats)
}

/// Register a session and start its runner
fn start_session(
    state: &AppState,
    kind: JobKind,
    inputs: BatchInput,
) -> (StatusCode, Json<RpcResponse<CreateSessionResponse>>) {
    let items = inputs.items.iter().map(|i| i.name.clone()).collect();
    let (session_id, entry) = state.registry.create(kind, inputs);
    state.runner.spawn(entry);

    (
        StatusCode::OK,
        Json(RpcResponse::ok(CreateSessionResponse {
            stream_endpoint: format!("/api/v1/web/sessions/{}/stream", session_id),
            status_endpoint: format!("/api/v1/web/sessions/{}/status", session_id),
            session_id,
            kind,
            status: SessionStatus::Created,
            items,
        })),
    )
}

// POST /api/v1/web/page-analysis/upload-and-analyze
pub async fn upload_and_analyze(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> (StatusCode, Json<RpcResponse<CreateSessionResponse>>) {
    let max_bytes = state.config.max_upload_bytes;
    let mut inputs = BatchInput::default();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return bad_request(format!("Invalid multipart body: {}", e)),
        };
        let field_name = field.name().unwrap_or_default().to_string();

        if field_name == "files" || field_name == "file" {
            let fallback = format!("upload-{}", inputs.items.len() + 1);
            match read_image_field(field, fallback, max_bytes).await {
                Ok(item) => inputs.items.push(item),
                Err(msg) => return bad_request(msg),
            }
            continue;
        }

        let value = match field.text().await {
            Ok(v) => v,
            Err(e) => return bad_request(format!("Failed to read {}: {}", field_name, e)),
        };
        match field_name.as_str() {
            "description" => inputs.context.description = non_blank(value),
            "page_url" => inputs.context.page_url = non_blank(value),
            "page_name" => inputs.context.page_name = non_blank(value),
            other => log::debug!("[ROUTES] Ignoring multipart field '{}'", other),
        }
    }

    if inputs.items.is_empty() {
        return bad_request("At least one image file is required");
    }

    log::info!(
        "[ROUTES] Page analysis requested for {} file(s)",
        inputs.items.len()
    );
    start_session(&state, JobKind::PageAnalysis, inputs)
}

// POST /api/v1/web/test-case-creation/analyze-image
pub async fn analyze_image(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> (StatusCode, Json<RpcResponse<CreateSessionResponse>>) {
    let max_bytes = state.config.max_upload_bytes;
    let mut image: Option<WorkItem> = None;
    let mut context = PageContext::default();
    let mut formats: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return bad_request(format!("Invalid multipart body: {}", e)),
        };
        let field_name = field.name().unwrap_or_default().to_string();

        if field_name == "file" {
            match read_image_field(field, "screenshot".to_string(), max_bytes).await {
                Ok(item) => image = Some(item),
                Err(msg) => return bad_request(msg),
            }
            continue;
        }

        let value = match field.text().await {
            Ok(v) => v,
            Err(e) => return bad_request(format!("Failed to read {}: {}", field_name, e)),
        };
        match field_name.as_str() {
            "test_description" => context.test_description = non_blank(value),
            "additional_context" => context.additional_context = non_blank(value),
            "generate_formats" => formats = non_blank(value),
            other => log::debug!("[ROUTES] Ignoring multipart field '{}'", other),
        }
    }

    if context.test_description.is_none() {
        return bad_request("test_description is required");
    }
    context.generate_formats = parse_formats(formats.as_deref());

    let item = image.unwrap_or_else(|| WorkItem::text_only("requirement"));
    start_session(
        &state,
        JobKind::TestScenarios,
        BatchInput {
            items: vec![item],
            context,
        },
    )
}

// POST /api/v1/web/test-case-creation/analyze-text
pub async fn analyze_text(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeTextRequest>,
) -> (StatusCode, Json<RpcResponse<CreateSessionResponse>>) {
    let test_description = match non_blank(req.test_description) {
        Some(d) => d,
        None => return bad_request("test_description is required"),
    };

    let context = PageContext {
        test_description: Some(test_description),
        additional_context: req.additional_context.and_then(non_blank),
        generate_formats: parse_formats(req.generate_formats.as_deref()),
        ..Default::default()
    };
    start_session(
        &state,
        JobKind::TestScenarios,
        BatchInput {
            items: vec![WorkItem::text_only("requirement")],
            context,
        },
    )
}

// POST /api/v1/web/test-case-creation/generate-scripts
pub async fn generate_scripts(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateScriptsRequest>,
) -> (StatusCode, Json<RpcResponse<CreateSessionResponse>>) {
    let formats = match script_formats(&req.generate_formats) {
        Ok(formats) => formats,
        Err(msg) => return bad_request(msg),
    };

    let mut test_scenarios = req.test_scenarios;
    let mut test_description = None;
    if let Some(source_id) = req.session_id.as_deref() {
        let source = match state.registry.get(source_id) {
            Some(entry) => entry,
            None => return not_found(format!("Session {} not found", source_id)),
        };
        let source_state = source.state.read();
        test_description = source_state.inputs.context.test_description.clone();
        if test_scenarios.is_empty() {
            test_scenarios = source_state
                .results
                .iter()
                .filter_map(|r| match r {
                    ItemResult::Scenarios(set) => Some(set.scenarios.iter().cloned()),
                    _ => None,
                })
                .flatten()
                .collect();
        }
    }

    if test_scenarios.is_empty() {
        return bad_request("test_scenarios is required");
    }

    log::info!(
        "[ROUTES] Script generation requested for {} scenario(s) in {}",
        test_scenarios.len(),
        formats.join(", ")
    );
    let context = PageContext {
        test_description,
        generate_formats: formats.clone(),
        test_scenarios,
        ..Default::default()
    };
    start_session(
        &state,
        JobKind::ScriptGeneration,
        BatchInput {
            items: formats.into_iter().map(WorkItem::text_only).collect(),
            context,
        },
    )
}

// =====================================================
// Sessions
// =====================================================

// GET /api/v1/web/sessions
pub async fn sessions_list(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<Vec<SessionStatusResponse>>>) {
    (StatusCode::OK, Json(RpcResponse::ok(state.registry.list())))
}

// GET /api/v1/web/sessions/:id/status
pub async fn session_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<RpcResponse<SessionStatusResponse>>) {
    match state.registry.get(&id) {
        Some(entry) => (StatusCode::OK, Json(RpcResponse::ok(entry.snapshot()))),
        None => not_found(format!("Session {} not found", id)),
    }
}

// DELETE /api/v1/web/sessions/:id
pub async fn session_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<RpcResponse<bool>>) {
    if state.registry.delete(&id) {
        (StatusCode::OK, Json(RpcResponse::ok(true)))
    } else {
        not_found(format!("Session {} not found", id))
    }
}

fn sse_event(frame: Frame) -> SseEvent {
    SseEvent::default()
        .id(frame.id.to_string())
        .event(frame.kind.as_str())
        .data(frame.data.to_string())
}

// GET /api/v1/web/sessions/:id/stream
pub async fn session_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let entry = match state.registry.get(&id) {
        Some(entry) => entry,
        None => {
            return not_found::<()>(format!("Session {} not found", id)).into_response();
        }
    };

    let (mut sink, rx) = ChannelSink::new(STREAM_BUFFER_FRAMES);
    let consumer = StreamConsumer::new(
        state.registry.clone(),
        entry,
        state.config.stream_poll,
        state.config.stream_grace,
    );
    tokio::spawn(async move {
        consumer.run(&mut sink).await;
    });

    let frames = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, Infallible>(sse_event(frame)), rx))
    });

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(frames),
    )
        .into_response()
}

// =====================================================
// Persisted analyses
// =====================================================

// GET /api/v1/web/pages
pub async fn pages_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageListQuery>,
) -> (StatusCode, Json<RpcResponse<PageList>>) {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(20).clamp(1, 100);

    match state.db.list_pages(page, page_size, query.search.as_deref()) {
        Ok((pages, total)) => (
            StatusCode::OK,
            Json(RpcResponse::ok(PageList {
                pages,
                total,
                page,
                page_size,
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to list pages: {}", e))),
        ),
    }
}

// GET /api/v1/web/pages/:id
pub async fn page_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> (StatusCode, Json<RpcResponse<PageAnalysisDetail>>) {
    match state.db.get_page(id) {
        Ok(Some(detail)) => (StatusCode::OK, Json(RpcResponse::ok(detail))),
        Ok(None) => not_found(format!("Page analysis #{} not found", id)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to load page: {}", e))),
        ),
    }
}

// GET /api/v1/web/pages/:id/elements
pub async fn page_elements(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> (StatusCode, Json<RpcResponse<ElementList>>) {
    match state.db.page_elements(id) {
        Ok(Some(elements)) => (
            StatusCode::OK,
            Json(RpcResponse::ok(ElementList {
                total: elements.len(),
                elements,
            })),
        ),
        Ok(None) => not_found(format!("Page analysis #{} not found", id)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to load elements: {}", e))),
        ),
    }
}

// DELETE /api/v1/web/pages/:id
pub async fn page_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> (StatusCode, Json<RpcResponse<bool>>) {
    match state.db.delete_page(id) {
        Ok(true) => (StatusCode::OK, Json(RpcResponse::ok(true))),
        Ok(false) => not_found(format!("Page analysis #{} not found", id)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to delete: {}", e))),
        ),
    }
}

// =====================================================
// Knowledge base
// =====================================================

// GET /api/v1/web/knowledge-base/summary
pub async fn knowledge_summary(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<KnowledgeBaseSummary>>) {
    match state.db.knowledge_summary() {
        Ok(summary) => (StatusCode::OK, Json(RpcResponse::ok(summary))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to summarize knowledge base: {}", e))),
        ),
    }
}

// GET /api/v1/web/knowledge-base/ui-elements/:element_type
pub async fn knowledge_elements_by_type(
    State(state): State<Arc<AppState>>,
    Path(element_type): Path<String>,
    Query(query): Query<LimitQuery>,
) -> (StatusCode, Json<RpcResponse<ElementList>>) {
    let element_type = element_type.trim();
    if element_type.is_empty() {
        return bad_request("element_type is required");
    }

    match state.db.elements_by_type(element_type, result_limit(query.limit)) {
        Ok(elements) => (
            StatusCode::OK,
            Json(RpcResponse::ok(ElementList {
                total: elements.len(),
                elements,
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to load elements: {}", e))),
        ),
    }
}

// POST /api/v1/web/knowledge-base/search-by-keywords
pub async fn knowledge_search_by_keywords(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KeywordSearchRequest>,
) -> (StatusCode, Json<RpcResponse<KeywordSearchResults>>) {
    let keywords: Vec<String> = req
        .keywords
        .into_iter()
        .filter_map(non_blank)
        .take(MAX_KEYWORDS)
        .collect();
    if keywords.is_empty() {
        return bad_request("keywords must not be empty");
    }

    match state.db.search_by_keywords(&keywords, result_limit(req.limit)) {
        Ok(results) => (
            StatusCode::OK,
            Json(RpcResponse::ok(KeywordSearchResults {
                total: results.len(),
                results,
                keywords,
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Keyword search failed: {}", e))),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_formats_default_dedupe_and_reject_unknown() {
        assert_eq!(script_formats(&[]).unwrap(), vec!["yaml", "playwright"]);
        assert_eq!(
            script_formats(&[" YAML".to_string(), "yaml".to_string()]).unwrap(),
            vec!["yaml"]
        );
        assert!(script_formats(&["cypress".to_string()]).is_err());
    }

    #[test]
    fn result_limits_are_clamped() {
        assert_eq!(result_limit(None), DEFAULT_RESULT_LIMIT);
        assert_eq!(result_limit(Some(0)), 1);
        assert_eq!(result_limit(Some(1000)), MAX_RESULT_LIMIT);
    }

    #[test]
    fn image_checks() {
        assert!(check_image("a.png", Some("image/png"), 10, 100).is_ok());
        assert!(check_image("a.txt", Some("text/plain"), 10, 100).is_err());
        assert!(check_image("a.png", None, 10, 100).is_err());
        assert!(check_image("a.png", Some("image/png"), 0, 100).is_err());
        assert!(check_image("a.png", Some("image/png"), 101, 100).is_err());
    }

    #[test]
    fn formats_are_split_and_normalized() {
        assert_eq!(parse_formats(Some(" YAML, playwright ,,")), vec!["yaml", "playwright"]);
        assert!(parse_formats(None).is_empty());
    }
}
