//! Persistence collaborators for agenda: the appointment store contract,
//! its Postgres and in-memory implementations, and upload staging.

mod memory;
mod postgres;
mod uploads;

use agenda_core::{Appointment, AppointmentFilter, Department, NewAppointment, Reason};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::warn;

pub use memory::{MemoryAppointmentStore, MemoryTransaction};
pub use postgres::{PgAppointmentStore, PgStoreTransaction};
pub use uploads::{discard_upload, StagedUpload, UploadError, UploadStore};

pub const CRATE_NAME: &str = "agenda-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Write operations that must share one commit/rollback boundary.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Bulk-inserts the drafts, returning the number of rows written.
    async fn insert_appointments(&mut self, drafts: &[NewAppointment]) -> Result<u64, StoreError>;

    /// Deletes every appointment sharing (summary, start, end) with a row of
    /// lower identifier, across the whole table. Returns the rows removed.
    async fn remove_duplicate_appointments(&mut self) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    /// All departments in insertion order.
    async fn departments(&self) -> Result<Vec<Department>, StoreError>;

    /// All reasons in insertion order.
    async fn reasons(&self) -> Result<Vec<Reason>, StoreError>;

    /// Appointments matching `filter`, ordered by start.
    async fn find_appointments(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, StoreError>;

    /// Count of every appointment with `from <= starts_at < until`.
    async fn count_appointments_starting_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Returns `true` when the acronym was not registered yet.
    async fn upsert_department(&self, acronym: &str) -> Result<bool, StoreError>;

    /// Returns `true` when the label was not registered yet.
    async fn upsert_reason(&self, label: &str) -> Result<bool, StoreError>;

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// Runs `work` inside one transaction: commit on `Ok`, rollback on `Err`.
///
/// A failed rollback is logged and the original error is returned.
pub async fn with_unit_of_work<S, T, F>(store: &S, work: F) -> Result<T, StoreError>
where
    S: AppointmentStore + ?Sized,
    T: Send,
    F: for<'t> FnOnce(&'t mut dyn StoreTransaction) -> BoxFuture<'t, Result<T, StoreError>> + Send,
{
    let mut tx = store.begin().await?;
    let outcome = work(tx.as_mut()).await;
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "transaction rollback failed");
            }
            Err(err)
        }
    }
}
