//! Tolerant normalization of free-form model output into `AnalysisRecord`.
//!
//! The generator is only prompted to emit JSON, so every layer here falls
//! through to the next instead of failing: structured schema, legacy
//! single-key schema, any array field, then one element per text line.

use page_analysis_types::{AnalysisRecord, ParseMode, UiElement};
use serde_json::{Map, Value};

/// Confidence when JSON parsed but no element carried a score
pub const DEFAULT_JSON_CONFIDENCE: f64 = 0.8;
/// Confidence assigned to every synthesized line element
pub const LINE_FALLBACK_CONFIDENCE: f64 = 0.7;

const LINE_DESCRIPTION_MAX_CHARS: usize = 200;
const UNKNOWN_TITLE: &str = "Unknown page";
const TEXT_FALLBACK_TITLE: &str = "Text analysis page";
const TEXT_FALLBACK_DESCRIPTION: &str = "Page analysis derived from unstructured model output";
const FAILED_TITLE: &str = "Parse failed";

/// Normalize raw generator text. Never fails.
pub fn normalize(text: &str) -> AnalysisRecord {
    match extract_object(text) {
        Some(object) => normalize_object(object),
        None => {
            log::debug!("[NORMALIZER] No JSON object found, using line fallback");
            line_fallback(text)
        }
    }
}

/// Record used when an item's analysis failed outright
pub fn failed_record(reason: &str) -> AnalysisRecord {
    AnalysisRecord {
        title: FAILED_TITLE.to_string(),
        description: reason.to_string(),
        elements: Vec::new(),
        confidence: 0.0,
        parse_mode: ParseMode::Failed,
        raw_source: Value::Object(Map::new()),
    }
}

/// Parse the span from the first `{` to the last `}` as a JSON object
fn extract_object(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => None,
        Err(e) => {
            log::debug!("[NORMALIZER] JSON decode failed: {}", e);
            None
        }
    }
}

fn normalize_object(object: Map<String, Value>) -> AnalysisRecord {
    let raw_source = Value::Object(object.clone());

    // New schema: {"title", "description", "elements": [...]}
    let structured = match object.get("elements") {
        Some(Value::Array(items))
            if object.contains_key("title") && object.contains_key("description") =>
        {
            Some(items)
        }
        _ => None,
    };
    if let Some(entries) = structured {
        let title = value_to_text(object.get("title")).unwrap_or_else(|| UNKNOWN_TITLE.to_string());
        let description = value_to_text(object.get("description")).unwrap_or_default();
        return build_record(title, description, entries, ParseMode::Structured, raw_source);
    }

    // Legacy schema: {"<title>": [{"description": ..}, element, ...]}
    if object.len() == 1 {
        if let Some((key, value)) = object.iter().next() {
            let mut description = String::new();
            let mut entries: &[Value] = match value {
                Value::Array(items) => items.as_slice(),
                _ => &[],
            };
            if let Some(Value::Object(first)) = entries.first() {
                if first.len() == 1 {
                    if let Some(desc) = first.get("description") {
                        description = value_to_text(Some(desc)).unwrap_or_default();
                        entries = &entries[1..];
                    }
                }
            }
            return build_record(key.clone(), description, entries, ParseMode::Legacy, raw_source);
        }
    }

    log::warn!("[NORMALIZER] Unrecognized JSON shape, taking first non-empty array");
    let entries = object
        .values()
        .find_map(|v| match v {
            Value::Array(items) if !items.is_empty() => Some(items.as_slice()),
            _ => None,
        })
        .unwrap_or(&[]);
    build_record(
        UNKNOWN_TITLE.to_string(),
        String::new(),
        entries,
        ParseMode::Unrecognized,
        raw_source,
    )
}

fn build_record(
    title: String,
    description: String,
    entries: &[Value],
    parse_mode: ParseMode,
    raw_source: Value,
) -> AnalysisRecord {
    let elements: Vec<UiElement> = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| element_from_value(entry, i))
        .collect();
    let confidence = mean_confidence(&elements).unwrap_or(DEFAULT_JSON_CONFIDENCE);

    AnalysisRecord {
        title,
        description,
        elements,
        confidence,
        parse_mode,
        raw_source,
    }
}

/// Map one loosely-shaped element entry. Missing fields are left empty.
fn element_from_value(entry: &Value, index: usize) -> UiElement {
    let object = match entry {
        Value::Object(map) => map,
        other => {
            return UiElement {
                id: format!("element_{:03}", index + 1),
                description: value_to_text(Some(other)).unwrap_or_default(),
                ..Default::default()
            };
        }
    };

    let text = |key: &str| value_to_text(object.get(key));

    UiElement {
        id: text("id").unwrap_or_default(),
        name: text("name").unwrap_or_default(),
        element_type: text("element_type")
            .or_else(|| text("type"))
            .unwrap_or_default(),
        description: text("description").unwrap_or_default(),
        position_hint: object
            .get("position_hint")
            .or_else(|| object.get("position"))
            .cloned(),
        visual_features: object.get("visual_features").cloned(),
        text_content: text("text_content"),
        functionality: text("functionality"),
        interaction_state: text("interaction_state"),
        confidence_score: object.get("confidence_score").and_then(score_from_value),
    }
}

fn score_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn mean_confidence(elements: &[UiElement]) -> Option<f64> {
    let scores: Vec<f64> = elements
        .iter()
        .filter_map(|e| e.confidence_score)
        .filter(|s| s.is_finite())
        .collect();
    if scores.is_empty() {
        return None;
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    Some(mean.clamp(0.0, 1.0))
}

/// One element per non-blank line, numbered by position in the trimmed text.
/// Text with no usable lines still yields an empty fallback record.
fn line_fallback(text: &str) -> AnalysisRecord {
    let elements: Vec<UiElement> = text
        .trim()
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| UiElement {
            id: format!("element_{}", i + 1),
            name: format!("Element {}", i + 1),
            element_type: "text".to_string(),
            description: line.trim().chars().take(LINE_DESCRIPTION_MAX_CHARS).collect(),
            confidence_score: Some(LINE_FALLBACK_CONFIDENCE),
            ..Default::default()
        })
        .collect();

    AnalysisRecord {
        title: TEXT_FALLBACK_TITLE.to_string(),
        description: TEXT_FALLBACK_DESCRIPTION.to_string(),
        elements,
        confidence: LINE_FALLBACK_CONFIDENCE,
        parse_mode: ParseMode::TextFallback,
        raw_source: serde_json::json!({ "text_content": text }),
    }
}
