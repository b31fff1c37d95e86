//! Core domain model for agenda: reference data, appointments and the
//! normalization used to match free text against reference labels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "agenda-core";

/// Coordinating department ("coordenadoria"), identified by its acronym.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub id: Uuid,
    pub acronym: String,
    pub active: bool,
}

/// Appointment reason ("motivo"), identified by its label text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    pub id: Uuid,
    pub label: String,
    pub active: bool,
}

/// Anything carrying a unique label that free text can be matched against.
pub trait ReferenceLabel {
    fn reference_id(&self) -> Uuid;
    fn reference_label(&self) -> &str;
}

impl ReferenceLabel for Department {
    fn reference_id(&self) -> Uuid {
        self.id
    }

    fn reference_label(&self) -> &str {
        &self.acronym
    }
}

impl ReferenceLabel for Reason {
    fn reference_id(&self) -> Uuid {
        self.id
    }

    fn reference_label(&self) -> &str {
        &self.label
    }
}

/// Duplicate-detection identity of an appointment. Not a storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppointmentKey {
    pub summary: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// Candidate appointment produced by the calendar import, before persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAppointment {
    pub summary: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub department_id: Option<Uuid>,
    pub reason_id: Option<Uuid>,
    pub imported: bool,
    pub legacy: bool,
}

impl NewAppointment {
    /// Imported rows are always flagged as imported legacy data.
    pub fn imported(summary: impl Into<String>, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Self {
        Self {
            summary: summary.into(),
            starts_at,
            ends_at,
            department_id: None,
            reason_id: None,
            imported: true,
            legacy: true,
        }
    }

    pub fn key(&self) -> AppointmentKey {
        AppointmentKey {
            summary: self.summary.clone(),
            starts_at: self.starts_at,
            ends_at: self.ends_at,
        }
    }
}

/// Citizen and process metadata, only filled by the manual booking path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CitizenDetails {
    pub name: Option<String>,
    pub rg: Option<String>,
    pub cpf: Option<String>,
    pub email: Option<String>,
    pub process_number: Option<String>,
    pub technician_id: Option<Uuid>,
}

/// Persisted appointment row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub summary: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub department_id: Option<Uuid>,
    pub reason_id: Option<Uuid>,
    pub imported: bool,
    pub legacy: bool,
    #[serde(default)]
    pub citizen: CitizenDetails,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    pub fn from_new(id: Uuid, draft: NewAppointment, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            summary: draft.summary,
            starts_at: draft.starts_at,
            ends_at: draft.ends_at,
            department_id: draft.department_id,
            reason_id: draft.reason_id,
            imported: draft.imported,
            legacy: draft.legacy,
            citizen: CitizenDetails::default(),
            created_at,
            updated_at: created_at,
        }
    }

    pub fn key(&self) -> AppointmentKey {
        AppointmentKey {
            summary: self.summary.clone(),
            starts_at: self.starts_at,
            ends_at: self.ends_at,
        }
    }
}

/// Dashboard selection. Every `None` field leaves that dimension unfiltered.
/// The start window is half-open: `starts_from <= starts_at < starts_before`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppointmentFilter {
    pub department_id: Option<Uuid>,
    pub reason_id: Option<Uuid>,
    pub starts_from: Option<DateTime<Utc>>,
    pub starts_before: Option<DateTime<Utc>>,
}

impl AppointmentFilter {
    pub fn matches(&self, appointment: &Appointment) -> bool {
        if self
            .department_id
            .is_some_and(|id| appointment.department_id != Some(id))
        {
            return false;
        }
        if self
            .reason_id
            .is_some_and(|id| appointment.reason_id != Some(id))
        {
            return false;
        }
        if self.starts_from.is_some_and(|from| appointment.starts_at < from) {
            return false;
        }
        if self
            .starts_before
            .is_some_and(|before| appointment.starts_at >= before)
        {
            return false;
        }
        true
    }
}

/// Matching token for free text: ASCII letters only, upper-cased.
///
/// Total and idempotent; accented letters, digits, spaces and punctuation are
/// all dropped, so `"Reunião - CT"` becomes `"REUNIOCT"`.
pub fn normalize_token(input: &str) -> String {
    input
        .chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
