use std::path::{Path, PathBuf};
use std::sync::Arc;

use agenda_ics::{extract_events, CalendarEvent, IcsError, ParsedCalendar};
use agenda_storage::{
    discard_upload, with_unit_of_work, AppointmentStore, StagedUpload, StoreError, UploadError,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::classify::Classifier;
use crate::dedup::ImportPlan;

/// Problems with the payload itself; the caller should not retry.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("could not read calendar payload {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed calendar payload: {0}")]
    Calendar(#[from] IcsError),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid input: {0}")]
    Input(#[from] InputError),
    #[error("import failed while persisting appointments")]
    Persistence(#[source] StoreError),
}

impl ImportError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, ImportError::Input(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOutcome {
    #[serde(rename = "agendamentos")]
    pub inserted: u64,
    #[serde(rename = "duplicados")]
    pub duplicates_removed: u64,
}

impl ImportOutcome {
    /// Net-new rows never go negative, even when stage B also removed
    /// duplicates that predate this run.
    pub fn from_counts(bulk_inserted: u64, duplicates_removed: u64) -> Self {
        Self {
            inserted: bulk_inserted.saturating_sub(duplicates_removed),
            duplicates_removed,
        }
    }
}

/// Decodes a payload into its events; non-UTF-8 bytes are replaced.
pub fn parse_payload(bytes: &[u8], default_tz: Tz) -> Result<Vec<CalendarEvent>, InputError> {
    let text = String::from_utf8_lossy(bytes);
    let calendar = ParsedCalendar::parse(&text)?;
    Ok(extract_events(&calendar, default_tz)?)
}

#[derive(Clone)]
pub struct ImportPipeline {
    store: Arc<dyn AppointmentStore>,
    default_tz: Tz,
}

impl ImportPipeline {
    pub fn new(store: Arc<dyn AppointmentStore>, default_tz: Tz) -> Self {
        Self { store, default_tz }
    }

    pub async fn import_upload(&self, upload: &StagedUpload) -> Result<ImportOutcome, ImportError> {
        let span = info_span!(
            "ics_import",
            run_id = %Uuid::new_v4(),
            path = %upload.path.display(),
            sha256 = %upload.content_hash,
        );
        self.run(&upload.path).instrument(span).await
    }

    /// Imports a staged file. The file is removed once read, whatever the
    /// outcome.
    pub async fn import_path(&self, path: &Path) -> Result<ImportOutcome, ImportError> {
        let span = info_span!("ics_import", run_id = %Uuid::new_v4(), path = %path.display());
        self.run(path).instrument(span).await
    }

    /// Parses and classifies without touching appointments. The staged file
    /// is still removed.
    pub async fn plan_path(&self, path: &Path) -> Result<ImportPlan, ImportError> {
        let events = self.load_events(path).await?;
        self.plan(&events).await
    }

    pub async fn plan(&self, events: &[CalendarEvent]) -> Result<ImportPlan, ImportError> {
        let departments = self
            .store
            .departments()
            .await
            .map_err(ImportError::Persistence)?;
        let reasons = self.store.reasons().await.map_err(ImportError::Persistence)?;
        let classifier = Classifier::new(&departments, &reasons);
        Ok(ImportPlan::build(events, &classifier))
    }

    async fn run(&self, path: &Path) -> Result<ImportOutcome, ImportError> {
        let events = self.load_events(path).await?;
        let plan = self.plan(&events).await?;
        info!(
            events = events.len(),
            candidates = plan.candidates.len(),
            skipped_cancelled = plan.skipped_cancelled,
            skipped_duplicates = plan.skipped_duplicates,
            unclassified_departments = plan.unclassified_departments,
            unclassified_reasons = plan.unclassified_reasons,
            "import planned"
        );

        let candidates = plan.candidates;
        let (inserted, removed) = with_unit_of_work(self.store.as_ref(), move |tx| {
            Box::pin(async move {
                let inserted = if candidates.is_empty() {
                    0
                } else {
                    tx.insert_appointments(&candidates).await?
                };
                let removed = tx.remove_duplicate_appointments().await?;
                Ok::<_, StoreError>((inserted, removed))
            })
        })
        .await
        .map_err(ImportError::Persistence)?;

        let outcome = ImportOutcome::from_counts(inserted, removed);
        info!(
            bulk_inserted = inserted,
            agendamentos = outcome.inserted,
            duplicados = outcome.duplicates_removed,
            "import committed"
        );
        Ok(outcome)
    }

    async fn load_events(&self, path: &Path) -> Result<Vec<CalendarEvent>, InputError> {
        let parsed = match fs::read(path).await {
            Ok(bytes) => parse_payload(&bytes, self.default_tz),
            Err(source) => Err(InputError::Unreadable {
                path: path.to_path_buf(),
                source,
            }),
        };
        discard_upload(path).await;
        parsed
    }
}
