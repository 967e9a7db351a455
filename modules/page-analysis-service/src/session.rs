//! Per-session state: lifecycle status, progress and accumulated results.

use chrono::{DateTime, Utc};
use page_analysis_types::{ItemResult, JobKind, PageContext, SessionStatus, SessionStatusResponse};
use std::sync::Arc;

/// One unit of work in a batch
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub name: String,
    pub content_type: Option<String>,
    /// Image bytes; required for page analysis, optional for scenario generation
    pub image: Option<Vec<u8>>,
}

impl WorkItem {
    pub fn image(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: Some(content_type.into()),
            image: Some(bytes),
        }
    }

    pub fn text_only(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_type: None,
            image: None,
        }
    }
}

/// Identifies one item of one session for persistence and logging
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub session_id: String,
    pub index: usize,
}

impl ItemKey {
    pub fn new(session_id: impl Into<String>, index: usize) -> Self {
        Self {
            session_id: session_id.into(),
            index,
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.session_id, self.index)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchInput {
    pub items: Vec<WorkItem>,
    pub context: PageContext,
}

/// Item counters. `processed` never exceeds `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressTracker {
    pub total: usize,
    pub processed: usize,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self { total, processed: 0 }
    }

    /// floor(processed / total * 100); 0 for an empty batch
    pub fn percent(&self) -> u8 {
        percent_of(self.processed, self.total)
    }

    fn increment(&mut self) -> bool {
        if self.processed >= self.total {
            return false;
        }
        self.processed += 1;
        true
    }
}

pub fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) * 100) / total) as u8
}

#[derive(Debug)]
pub struct SessionState {
    pub id: String,
    pub kind: JobKind,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Immutable after creation
    pub inputs: Arc<BatchInput>,
    pub progress: ProgressTracker,
    pub results: Vec<ItemResult>,
    pub error: Option<String>,
}

impl SessionState {
    pub fn new(id: String, kind: JobKind, inputs: BatchInput) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            status: SessionStatus::Created,
            created_at: now,
            last_activity_at: now,
            completed_at: None,
            progress: ProgressTracker::new(inputs.items.len()),
            inputs: Arc::new(inputs),
            results: Vec::new(),
            error: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn start_processing(&mut self) -> bool {
        if self.status != SessionStatus::Created {
            return false;
        }
        self.status = SessionStatus::Processing;
        self.touch();
        true
    }

    /// Append one item's result and advance progress
    pub fn record_result(&mut self, result: ItemResult) {
        if self.status.is_terminal() || !self.progress.increment() {
            log::warn!("[SESSION] {} ignoring result past end of batch", self.id);
            return;
        }
        self.results.push(result);
        self.touch();
    }

    pub fn complete(&mut self) -> bool {
        if self.status != SessionStatus::Processing
            || self.progress.processed != self.progress.total
        {
            return false;
        }
        let now = Utc::now();
        self.status = SessionStatus::Completed;
        self.completed_at = Some(now);
        self.last_activity_at = now;
        true
    }

    /// Reachable from any non-terminal status
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        self.status = SessionStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        self.last_activity_at = now;
        true
    }

    pub fn snapshot(&self) -> SessionStatusResponse {
        SessionStatusResponse {
            session_id: self.id.clone(),
            kind: self.kind,
            status: self.status,
            progress: self.progress.percent(),
            total_items: self.progress.total,
            processed_items: self.progress.processed,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            error: self.error.clone(),
            completed_at: self.completed_at,
            context: self.inputs.context.clone(),
        }
    }
}
