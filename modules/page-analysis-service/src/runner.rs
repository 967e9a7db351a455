//! Background runner that drives one session's batch through its analysis
//! stage, publishing progress into the session's event queue.

use crate::analyzer::{AnalysisRequest, Analyzer, AnalyzerError};
use crate::db::AnalysisStore;
use crate::normalizer;
use crate::registry::{SessionEntry, SessionRegistry};
use crate::scenarios;
use crate::scripts;
use crate::session::{BatchInput, ItemKey, WorkItem, percent_of};
use page_analysis_types::{BatchSummary, EventPayload, ItemResult, JobKind, PageContext, Region};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const SYSTEM_SOURCE: &str = "system";

/// Errors that abort the whole batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    EmptyBatch,
    MissingPayload { index: usize, name: String },
    MissingDescription,
    MissingScenarios,
    Cancelled,
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchError::EmptyBatch => write!(f, "batch contains no items"),
            BatchError::MissingPayload { index, name } => {
                write!(f, "item {} ({}) has no image data", index, name)
            }
            BatchError::MissingDescription => write!(f, "test description is required"),
            BatchError::MissingScenarios => write!(f, "no test scenarios to generate scripts from"),
            BatchError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for BatchError {}

/// Check a batch before any work starts
pub fn validate(kind: JobKind, inputs: &BatchInput) -> Result<(), BatchError> {
    if inputs.items.is_empty() {
        return Err(BatchError::EmptyBatch);
    }
    match kind {
        JobKind::PageAnalysis => {
            for (index, item) in inputs.items.iter().enumerate() {
                if item.image.as_ref().is_none_or(|bytes| bytes.is_empty()) {
                    return Err(BatchError::MissingPayload {
                        index,
                        name: item.name.clone(),
                    });
                }
            }
        }
        JobKind::TestScenarios => {
            let described = inputs
                .context
                .test_description
                .as_deref()
                .is_some_and(|d| !d.trim().is_empty());
            if !described {
                return Err(BatchError::MissingDescription);
            }
        }
        JobKind::ScriptGeneration => {
            if inputs.context.test_scenarios.is_empty() {
                return Err(BatchError::MissingScenarios);
            }
        }
    }
    Ok(())
}

fn stage_source(kind: JobKind) -> &'static str {
    match kind {
        JobKind::PageAnalysis => "page_analyzer",
        JobKind::TestScenarios => "scenario_generator",
        JobKind::ScriptGeneration => "script_generator",
    }
}

fn normalize_output(kind: JobKind, item: &WorkItem, context: &PageContext, text: &str) -> ItemResult {
    match kind {
        JobKind::PageAnalysis => ItemResult::Page(normalizer::normalize(text)),
        JobKind::TestScenarios => ItemResult::Scenarios(scenarios::parse(text)),
        JobKind::ScriptGeneration => ItemResult::Script(scripts::extract(
            &item.name,
            context.test_scenarios.len(),
            text,
        )),
    }
}

/// Zero-confidence result stored for an item whose analysis failed
fn placeholder(
    kind: JobKind,
    item: &WorkItem,
    context: &PageContext,
    error: &AnalyzerError,
) -> ItemResult {
    match kind {
        JobKind::PageAnalysis => ItemResult::Page(normalizer::failed_record(&error.to_string())),
        JobKind::TestScenarios => ItemResult::Scenarios(scenarios::failed_set()),
        JobKind::ScriptGeneration => ItemResult::Script(scripts::failed_script(
            &item.name,
            context.test_scenarios.len(),
        )),
    }
}

fn describe(result: &ItemResult) -> String {
    match result {
        ItemResult::Page(record) => format!(
            "{}: {} elements, confidence {:.2}",
            record.title,
            record.elements.len(),
            record.confidence
        ),
        ItemResult::Scenarios(set) => format!(
            "{} test scenarios ({} high priority), confidence {:.2}{}",
            set.scenarios.len(),
            set.summary.high_priority,
            set.confidence,
            if set.degraded { ", using defaults" } else { "" }
        ),
        ItemResult::Script(script) => format!(
            "{}: {} lines covering {} scenarios{}",
            script.file_name,
            script.content.lines().count(),
            script.scenario_count,
            if script.degraded { ", empty script" } else { "" }
        ),
    }
}

pub struct AnalysisTaskRunner {
    registry: Arc<SessionRegistry>,
    analyzer: Arc<dyn Analyzer>,
    store: Arc<dyn AnalysisStore>,
    session_timeout: Duration,
}

impl AnalysisTaskRunner {
    pub fn new(
        registry: Arc<SessionRegistry>,
        analyzer: Arc<dyn Analyzer>,
        store: Arc<dyn AnalysisStore>,
        session_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            analyzer,
            store,
            session_timeout,
        }
    }

    /// Run detached; the returned handle is only awaited by tests
    pub fn spawn(self: &Arc<Self>, entry: Arc<SessionEntry>) -> tokio::task::JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move { runner.run(entry).await })
    }

    pub async fn run(&self, entry: Arc<SessionEntry>) {
        let session_id = entry.queue.session_id().to_string();
        let queue = &entry.queue;

        match self.process(&session_id, &entry).await {
            Ok(summary) => {
                let completed = entry.state.write().complete();
                if !completed {
                    log::warn!("[RUNNER] Session {} could not be marked completed", session_id);
                }
                log::info!(
                    "[RUNNER] Session {} completed: {}/{} succeeded, avg confidence {:.2}",
                    session_id,
                    summary.succeeded,
                    summary.total_items,
                    summary.average_confidence
                );
                let content = format!(
                    "Analysis complete: {} of {} items succeeded",
                    summary.succeeded, summary.total_items
                );
                queue.put(
                    SYSTEM_SOURCE,
                    EventPayload::FinalResult {
                        content,
                        result: summary,
                    },
                );
            }
            Err(e) => {
                log::error!("[RUNNER] Session {} failed: {}", session_id, e);
                entry.state.write().fail(e.to_string());
                queue.put(
                    SYSTEM_SOURCE,
                    EventPayload::Error {
                        content: format!("Analysis failed: {}", e),
                        error: e.to_string(),
                    },
                );
            }
        }

        self.registry
            .schedule_eviction(&session_id, self.session_timeout);
    }

    async fn process(
        &self,
        session_id: &str,
        entry: &SessionEntry,
    ) -> Result<BatchSummary, BatchError> {
        let (kind, inputs) = {
            let state = entry.state.read();
            (state.kind, Arc::clone(&state.inputs))
        };
        validate(kind, &inputs)?;

        entry.state.write().start_processing();
        let total = inputs.items.len();
        let source = stage_source(kind);
        entry.queue.put(
            SYSTEM_SOURCE,
            EventPayload::Message {
                content: format!("Starting {} for {} item(s)", kind, total),
                region: Region::Process,
            },
        );

        let mut succeeded = 0usize;
        for (index, item) in inputs.items.iter().enumerate() {
            if entry.cancel.is_cancelled() {
                return Err(BatchError::Cancelled);
            }

            entry.queue.put(
                SYSTEM_SOURCE,
                EventPayload::Progress {
                    content: format!("Analyzing {} ({}/{})", item.name, index + 1, total),
                    index: index + 1,
                    total,
                    percent: percent_of(index, total),
                },
            );

            let request = AnalysisRequest {
                kind,
                index,
                item,
                context: &inputs.context,
            };
            let outcome = tokio::select! {
                _ = entry.cancel.cancelled() => return Err(BatchError::Cancelled),
                outcome = self.analyzer.invoke(request) => outcome,
            };

            // Result and progress land in the state before the outcome is announced
            let key = ItemKey::new(session_id, index);
            match outcome {
                Ok(text) => {
                    let result = normalize_output(kind, item, &inputs.context, &text);
                    succeeded += 1;
                    log::info!("[RUNNER] Item {} produced {} entries", key, result.entry_count());
                    let content = describe(&result);
                    entry.state.write().record_result(result.clone());
                    entry.queue.put(
                        source,
                        EventPayload::Message {
                            content,
                            region: Region::Analysis,
                        },
                    );
                    self.persist(&key, &inputs, result).await;
                }
                Err(e) => {
                    log::warn!("[RUNNER] Item {} ({}) failed: {}", key, item.name, e);
                    let result = placeholder(kind, item, &inputs.context, &e);
                    entry.state.write().record_result(result);
                    entry.queue.put(
                        source,
                        EventPayload::Message {
                            content: format!("Failed to analyze {}: {}", item.name, e),
                            region: Region::Error,
                        },
                    );
                }
            }
        }

        let state = entry.state.read();
        let confidence_scores: Vec<f64> = state.results.iter().map(|r| r.confidence()).collect();
        let average_confidence = if confidence_scores.is_empty() {
            0.0
        } else {
            confidence_scores.iter().sum::<f64>() / confidence_scores.len() as f64
        };

        Ok(BatchSummary {
            total_items: total,
            processed_items: state.progress.processed,
            succeeded,
            failed: state.progress.processed - succeeded,
            confidence_scores,
            average_confidence,
            results: state.results.clone(),
        })
    }

    /// Store on a blocking thread; failures are logged only
    async fn persist(&self, key: &ItemKey, inputs: &Arc<BatchInput>, result: ItemResult) {
        let store = Arc::clone(&self.store);
        let inputs = Arc::clone(inputs);
        let key = key.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let stored = store.store(&key, &inputs.context, &result);
            (key, stored)
        })
        .await;

        match joined {
            Ok((key, Ok(row_id))) => {
                log::debug!("[RUNNER] Stored {} as row {}", key, row_id);
            }
            Ok((key, Err(e))) => {
                log::warn!("[RUNNER] Storage failed for {}: {}", key, e);
            }
            Err(e) => {
                log::warn!("[RUNNER] Storage task panicked: {}", e);
            }
        }
    }
}
