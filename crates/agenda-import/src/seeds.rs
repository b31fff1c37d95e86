use std::path::Path;

use agenda_core::normalize_token;
use agenda_storage::{AppointmentStore, StoreError};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

/// Reference data kept in `seeds.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub coordenadorias: Vec<String>,
    #[serde(default)]
    pub motivos: Vec<String>,
}

impl SeedFile {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing seed file")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub departments_created: usize,
    pub reasons_created: usize,
}

/// Registers missing labels in file order.
///
/// Labels without any ASCII letter are skipped with a warning: once stored
/// they would classify every imported event.
pub async fn apply_seeds<S>(store: &S, seeds: &SeedFile) -> Result<SeedSummary, StoreError>
where
    S: AppointmentStore + ?Sized,
{
    let mut summary = SeedSummary::default();
    for acronym in matchable_labels(&seeds.coordenadorias, "coordenadorias") {
        if store.upsert_department(acronym).await? {
            summary.departments_created += 1;
        }
    }
    for label in matchable_labels(&seeds.motivos, "motivos") {
        if store.upsert_reason(label).await? {
            summary.reasons_created += 1;
        }
    }
    info!(
        departments_created = summary.departments_created,
        reasons_created = summary.reasons_created,
        "reference data seeded"
    );
    Ok(summary)
}

fn matchable_labels<'a>(labels: &'a [String], section: &'static str) -> Vec<&'a str> {
    labels
        .iter()
        .map(|s| s.trim())
        .filter(|label| {
            if label.is_empty() {
                return false;
            }
            let matchable = !normalize_token(label).is_empty();
            if !matchable {
                warn!(section, label = %label, "skipping seed label without letters");
            }
            matchable
        })
        .collect()
}
