use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use agenda_core::{Appointment, AppointmentFilter, AppointmentKey, Department, NewAppointment, Reason};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{AppointmentStore, StoreError, StoreTransaction};

#[derive(Debug)]
struct MemoryState {
    departments: Vec<Department>,
    reasons: Vec<Reason>,
    appointments: Vec<Appointment>,
    next_id: u128,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            departments: Vec::new(),
            reasons: Vec::new(),
            appointments: Vec::new(),
            next_id: 1,
        }
    }
}

impl MemoryState {
    fn allocate_id(&mut self) -> Uuid {
        let id = Uuid::from_u128(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Process-local store with the same transactional contract as Postgres.
///
/// Identifiers come from a counter, so a row created earlier always has a
/// lower id. An open transaction holds the state lock until it finishes.
#[derive(Debug, Clone, Default)]
pub struct MemoryAppointmentStore {
    state: Arc<Mutex<MemoryState>>,
    fail_duplicate_removal: Arc<AtomicBool>,
    transactions_started: Arc<AtomicUsize>,
}

impl MemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_department(&self, acronym: &str) -> Uuid {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state.departments.push(Department {
            id,
            acronym: acronym.to_string(),
            active: true,
        });
        id
    }

    pub async fn add_reason(&self, label: &str) -> Uuid {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state.reasons.push(Reason {
            id,
            label: label.to_string(),
            active: true,
        });
        id
    }

    /// Inserts a row directly, bypassing any duplicate handling.
    pub async fn add_appointment(&self, draft: NewAppointment) -> Uuid {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state
            .appointments
            .push(Appointment::from_new(id, draft, Utc::now()));
        id
    }

    pub async fn appointments(&self) -> Vec<Appointment> {
        self.state.lock().await.appointments.clone()
    }

    /// Makes the next `remove_duplicate_appointments` call fail.
    pub fn fail_next_duplicate_removal(&self) {
        self.fail_duplicate_removal.store(true, Ordering::SeqCst);
    }

    pub fn transactions_started(&self) -> usize {
        self.transactions_started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AppointmentStore for MemoryAppointmentStore {
    async fn departments(&self) -> Result<Vec<Department>, StoreError> {
        Ok(self.state.lock().await.departments.clone())
    }

    async fn reasons(&self) -> Result<Vec<Reason>, StoreError> {
        Ok(self.state.lock().await.reasons.clone())
    }

    async fn find_appointments(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<Appointment> = state
            .appointments
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        rows.sort_by_key(|a| (a.starts_at, a.id));
        Ok(rows)
    }

    async fn count_appointments_starting_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .appointments
            .iter()
            .filter(|a| a.starts_at >= from && a.starts_at < until)
            .count() as u64)
    }

    async fn upsert_department(&self, acronym: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.departments.iter().any(|d| d.acronym == acronym) {
            return Ok(false);
        }
        let id = state.allocate_id();
        state.departments.push(Department {
            id,
            acronym: acronym.to_string(),
            active: true,
        });
        Ok(true)
    }

    async fn upsert_reason(&self, label: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.reasons.iter().any(|r| r.label == label) {
            return Ok(false);
        }
        let id = state.allocate_id();
        state.reasons.push(Reason {
            id,
            label: label.to_string(),
            active: true,
        });
        Ok(true)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        self.transactions_started.fetch_add(1, Ordering::SeqCst);
        let guard = self.state.clone().lock_owned().await;
        let working = guard.appointments.clone();
        let next_id = guard.next_id;
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            next_id,
            fail_duplicate_removal: self.fail_duplicate_removal.clone(),
        }))
    }
}

/// Works on a copy of the rows; only `commit` publishes it.
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: Vec<Appointment>,
    next_id: u128,
    fail_duplicate_removal: Arc<AtomicBool>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn insert_appointments(&mut self, drafts: &[NewAppointment]) -> Result<u64, StoreError> {
        let now = Utc::now();
        for draft in drafts {
            let id = Uuid::from_u128(self.next_id);
            self.next_id += 1;
            self.working
                .push(Appointment::from_new(id, draft.clone(), now));
        }
        Ok(drafts.len() as u64)
    }

    async fn remove_duplicate_appointments(&mut self) -> Result<u64, StoreError> {
        if self.fail_duplicate_removal.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "injected duplicate removal failure".into(),
            ));
        }

        let mut survivors: HashMap<AppointmentKey, Uuid> = HashMap::new();
        for row in &self.working {
            survivors
                .entry(row.key())
                .and_modify(|id| *id = (*id).min(row.id))
                .or_insert(row.id);
        }
        let before = self.working.len();
        self.working.retain(|row| survivors.get(&row.key()) == Some(&row.id));
        Ok((before - self.working.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            mut guard,
            working,
            next_id,
            ..
        } = *self;
        guard.appointments = working;
        guard.next_id = next_id;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn draft(summary: &str, hour: u32) -> NewAppointment {
        NewAppointment::imported(
            summary,
            Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 1, hour + 1, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn duplicate_removal_keeps_lowest_id_per_group() {
        let store = MemoryAppointmentStore::new();
        let oldest = store.add_appointment(draft("Reunião CT", 9)).await;
        store.add_appointment(draft("Reunião CT", 9)).await;
        let other = store.add_appointment(draft("Reunião ST", 9)).await;

        let mut tx = store.begin().await.unwrap();
        tx.insert_appointments(&[draft("Reunião CT", 9)]).await.unwrap();
        let removed = tx.remove_duplicate_appointments().await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(removed, 2);
        let ids: Vec<_> = store.appointments().await.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![oldest, other]);
    }

    #[tokio::test]
    async fn rollback_discards_inserted_rows() {
        let store = MemoryAppointmentStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_appointments(&[draft("CT", 9)]).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.appointments().await.is_empty());
        assert_eq!(store.transactions_started(), 1);
    }

    #[tokio::test]
    async fn upserts_are_idempotent_and_keep_insertion_order() {
        let store = MemoryAppointmentStore::new();
        assert!(store.upsert_department("ST").await.unwrap());
        assert!(store.upsert_department("CT").await.unwrap());
        assert!(!store.upsert_department("ST").await.unwrap());
        let acronyms: Vec<_> = store
            .departments()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.acronym)
            .collect();
        assert_eq!(acronyms, vec!["ST", "CT"]);
    }
}
