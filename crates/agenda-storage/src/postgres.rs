use agenda_core::{Appointment, AppointmentFilter, CitizenDetails, Department, NewAppointment, Reason};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::{AppointmentStore, StoreError, StoreTransaction};

/// Rows per INSERT statement; ten binds each keeps well under the 65535 limit.
const INSERT_CHUNK: usize = 1_000;

const APPOINTMENT_COLUMNS: &str = r#"
    id, resumo, data_inicio, data_fim, coordenadoria_id, motivo_id,
    importado, legado, municipe, rg, cpf, email, processo, tecnico_id,
    criado_em, atualizado_em
"#;

#[derive(Debug, Clone)]
pub struct PgAppointmentStore {
    pool: PgPool,
}

impl PgAppointmentStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl AppointmentStore for PgAppointmentStore {
    async fn departments(&self) -> Result<Vec<Department>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, sigla, status
              FROM coordenadorias
             ORDER BY criado_em, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Department {
                id: row.try_get("id")?,
                acronym: row.try_get("sigla")?,
                active: row.try_get("status")?,
            });
        }
        Ok(out)
    }

    async fn reasons(&self) -> Result<Vec<Reason>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, texto, status
              FROM motivos
             ORDER BY criado_em, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Reason {
                id: row.try_get("id")?,
                label: row.try_get("texto")?,
                active: row.try_get("status")?,
            });
        }
        Ok(out)
    }

    async fn find_appointments(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, StoreError> {
        let sql = format!(
            r#"
            SELECT {APPOINTMENT_COLUMNS}
              FROM agendamentos
             WHERE ($1::uuid IS NULL OR coordenadoria_id = $1)
               AND ($2::uuid IS NULL OR motivo_id = $2)
               AND ($3::timestamptz IS NULL OR data_inicio >= $3)
               AND ($4::timestamptz IS NULL OR data_inicio < $4)
             ORDER BY data_inicio ASC, id ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.department_id)
            .bind(filter.reason_id)
            .bind(filter.starts_from)
            .bind(filter.starts_before)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(appointment_from_row(row)?);
        }
        Ok(out)
    }

    async fn count_appointments_starting_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
              FROM agendamentos
             WHERE data_inicio >= $1
               AND data_inicio < $2
            "#,
        )
        .bind(from)
        .bind(until)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    async fn upsert_department(&self, acronym: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO coordenadorias (id, sigla)
            VALUES ($1, $2)
            ON CONFLICT (sigla) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(acronym)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn upsert_reason(&self, label: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO motivos (id, texto)
            VALUES ($1, $2)
            ON CONFLICT (texto) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(label)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTransaction { tx }))
    }
}

pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn insert_appointments(&mut self, drafts: &[NewAppointment]) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut inserted = 0u64;
        for chunk in drafts.chunks(INSERT_CHUNK) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO agendamentos (id, resumo, data_inicio, data_fim, coordenadoria_id, motivo_id, importado, legado, criado_em, atualizado_em) ",
            );
            builder.push_values(chunk, |mut row, draft| {
                row.push_bind(Uuid::now_v7())
                    .push_bind(draft.summary.clone())
                    .push_bind(draft.starts_at)
                    .push_bind(draft.ends_at)
                    .push_bind(draft.department_id)
                    .push_bind(draft.reason_id)
                    .push_bind(draft.imported)
                    .push_bind(draft.legacy)
                    .push_bind(now)
                    .push_bind(now);
            });
            let result = builder.build().execute(&mut *self.tx).await?;
            inserted += result.rows_affected();
        }
        debug!(inserted, "bulk inserted appointments");
        Ok(inserted)
    }

    async fn remove_duplicate_appointments(&mut self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM agendamentos
             WHERE id IN (
                   SELECT id
                     FROM (
                           SELECT id,
                                  ROW_NUMBER() OVER (
                                      PARTITION BY resumo, data_inicio, data_fim
                                      ORDER BY id
                                  ) AS row_rank
                             FROM agendamentos
                          ) ranked
                    WHERE ranked.row_rank > 1
                   )
            "#,
        )
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn appointment_from_row(row: &PgRow) -> Result<Appointment, sqlx::Error> {
    Ok(Appointment {
        id: row.try_get("id")?,
        summary: row.try_get::<Option<String>, _>("resumo")?.unwrap_or_default(),
        starts_at: row.try_get("data_inicio")?,
        ends_at: row.try_get("data_fim")?,
        department_id: row.try_get("coordenadoria_id")?,
        reason_id: row.try_get("motivo_id")?,
        imported: row.try_get("importado")?,
        legacy: row.try_get("legado")?,
        citizen: CitizenDetails {
            name: row.try_get("municipe")?,
            rg: row.try_get("rg")?,
            cpf: row.try_get("cpf")?,
            email: row.try_get("email")?,
            process_number: row.try_get("processo")?,
            technician_id: row.try_get("tecnico_id")?,
        },
        created_at: row.try_get("criado_em")?,
        updated_at: row.try_get("atualizado_em")?,
    })
}
