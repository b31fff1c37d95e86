use std::collections::HashSet;

use agenda_core::{AppointmentKey, NewAppointment};
use agenda_ics::CalendarEvent;
use serde::Serialize;
use tracing::debug;

use crate::classify::Classifier;

pub const CANCELLED_MARKER: &str = "cancelado";

pub fn is_cancelled(summary: &str) -> bool {
    summary.to_lowercase().contains(CANCELLED_MARKER)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Cancelled,
    Duplicate,
}

/// Stage A: in-memory filter over one batch.
#[derive(Debug, Default)]
pub struct BatchDeduplicator {
    seen: HashSet<AppointmentKey>,
}

impl BatchDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancelled summaries are rejected before the duplicate check, so they
    /// never occupy a key.
    pub fn admit(&mut self, key: AppointmentKey) -> Admission {
        if is_cancelled(&key.summary) {
            return Admission::Cancelled;
        }
        if self.seen.insert(key) {
            Admission::Accepted
        } else {
            Admission::Duplicate
        }
    }
}

/// Candidates that survived stage A, plus what was dropped on the way.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportPlan {
    pub candidates: Vec<NewAppointment>,
    pub skipped_cancelled: usize,
    pub skipped_duplicates: usize,
    pub unclassified_departments: usize,
    pub unclassified_reasons: usize,
}

impl ImportPlan {
    pub fn build(events: &[CalendarEvent], classifier: &Classifier) -> Self {
        let mut plan = ImportPlan::default();
        let mut dedup = BatchDeduplicator::new();

        for event in events {
            let mut draft = NewAppointment::imported(event.summary.clone(), event.starts_at, event.ends_at);
            match dedup.admit(draft.key()) {
                Admission::Cancelled => {
                    plan.skipped_cancelled += 1;
                    continue;
                }
                Admission::Duplicate => {
                    plan.skipped_duplicates += 1;
                    continue;
                }
                Admission::Accepted => {}
            }

            let classification = classifier.classify(&draft.summary);
            if classification.department_id.is_none() || classification.reason_id.is_none() {
                debug!(
                    event = %event.key,
                    summary = %draft.summary,
                    department = classification.department_id.is_some(),
                    reason = classification.reason_id.is_some(),
                    "event only partially classified"
                );
            }
            if classification.department_id.is_none() {
                plan.unclassified_departments += 1;
            }
            if classification.reason_id.is_none() {
                plan.unclassified_reasons += 1;
            }
            draft.department_id = classification.department_id;
            draft.reason_id = classification.reason_id;
            plan.candidates.push(draft);
        }

        plan
    }
}
