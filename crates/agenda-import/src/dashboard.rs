use std::collections::HashMap;

use agenda_core::{Appointment, AppointmentFilter, Department, Reason, ReferenceLabel};
use agenda_storage::{AppointmentStore, StoreError};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MONTH_NAMES: [&str; 12] = [
    "Janeiro",
    "Fevereiro",
    "Março",
    "Abril",
    "Maio",
    "Junho",
    "Julho",
    "Agosto",
    "Setembro",
    "Outubro",
    "Novembro",
    "Dezembro",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountBucket {
    pub label: String,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeriodTotals {
    pub year: u64,
    pub month: u64,
    pub day: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dashboard {
    #[serde(rename = "coordenadorias")]
    pub departments: Vec<CountBucket>,
    #[serde(rename = "motivos")]
    pub reasons: Vec<CountBucket>,
    #[serde(rename = "agendamentosMes")]
    pub per_month: Vec<CountBucket>,
    pub total: u64,
    #[serde(rename = "totalAno")]
    pub total_year: u64,
    #[serde(rename = "totalMes")]
    pub total_month: u64,
    #[serde(rename = "totalDia")]
    pub total_day: u64,
}

/// Dashboard filter in calendar terms; both dates are inclusive days.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DashboardQuery {
    pub department_id: Option<Uuid>,
    pub reason_id: Option<Uuid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DashboardQuery {
    pub fn to_filter(&self, tz: Tz) -> AppointmentFilter {
        AppointmentFilter {
            department_id: self.department_id,
            reason_id: self.reason_id,
            starts_from: self.from.map(|day| local_midnight(day, tz)),
            starts_before: self.to.map(|day| local_midnight(day + Duration::days(1), tz)),
        }
    }
}

/// Half-open UTC windows for the local year, month and day containing `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodWindows {
    pub year: (DateTime<Utc>, DateTime<Utc>),
    pub month: (DateTime<Utc>, DateTime<Utc>),
    pub day: (DateTime<Utc>, DateTime<Utc>),
}

impl PeriodWindows {
    pub fn containing(now: DateTime<Tz>) -> Self {
        let tz = now.timezone();
        let today = now.date_naive();

        let year_start = today - Duration::days(i64::from(today.ordinal0()));
        let after_year = year_start + Duration::days(366);
        let next_year = after_year - Duration::days(i64::from(after_year.ordinal0()));

        let month_start = today - Duration::days(i64::from(today.day0()));
        let after_month = month_start + Duration::days(31);
        let next_month = after_month - Duration::days(i64::from(after_month.day0()));

        let tomorrow = today + Duration::days(1);

        Self {
            year: (local_midnight(year_start, tz), local_midnight(next_year, tz)),
            month: (local_midnight(month_start, tz), local_midnight(next_month, tz)),
            day: (local_midnight(today, tz), local_midnight(tomorrow, tz)),
        }
    }
}

/// Start of `day` in `tz`. Zones that skip midnight start the day at the
/// first existing instant.
pub fn local_midnight(day: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = day.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// Builds the breakdowns from `filtered`; `totals` are taken as given since
/// they describe the whole table.
pub fn aggregate(
    filtered: &[Appointment],
    departments: &[Department],
    reasons: &[Reason],
    totals: PeriodTotals,
    now: DateTime<Tz>,
) -> Dashboard {
    let tz = now.timezone();

    let mut per_department: HashMap<Uuid, u64> = HashMap::new();
    let mut per_reason: HashMap<Uuid, u64> = HashMap::new();
    let mut per_month = [0u64; 12];
    for appointment in filtered {
        if let Some(id) = appointment.department_id {
            *per_department.entry(id).or_default() += 1;
        }
        if let Some(id) = appointment.reason_id {
            *per_reason.entry(id).or_default() += 1;
        }
        let local = appointment.starts_at.with_timezone(&tz);
        if local.year() == now.year() && local.month() <= now.month() {
            per_month[local.month0() as usize] += 1;
        }
    }

    let months = (0..now.month0() as usize + 1)
        .map(|m| CountBucket {
            label: format!("{}/{}", MONTH_NAMES[m], now.year()),
            value: per_month[m],
        })
        .collect();

    Dashboard {
        departments: breakdown(departments, &per_department),
        reasons: breakdown(reasons, &per_reason),
        per_month: months,
        total: filtered.len() as u64,
        total_year: totals.year,
        total_month: totals.month,
        total_day: totals.day,
    }
}

fn breakdown<T: ReferenceLabel>(items: &[T], counts: &HashMap<Uuid, u64>) -> Vec<CountBucket> {
    items
        .iter()
        .filter_map(|item| {
            let value = counts.get(&item.reference_id()).copied().unwrap_or(0);
            (value > 0).then(|| CountBucket {
                label: item.reference_label().to_string(),
                value,
            })
        })
        .collect()
}

pub async fn build_dashboard<S>(
    store: &S,
    query: &DashboardQuery,
    now: DateTime<Tz>,
) -> Result<Dashboard, StoreError>
where
    S: AppointmentStore + ?Sized,
{
    let filter = query.to_filter(now.timezone());
    let departments = store.departments().await?;
    let reasons = store.reasons().await?;
    let filtered = store.find_appointments(&filter).await?;

    let windows = PeriodWindows::containing(now);
    let totals = PeriodTotals {
        year: store
            .count_appointments_starting_between(windows.year.0, windows.year.1)
            .await?,
        month: store
            .count_appointments_starting_between(windows.month.0, windows.month.1)
            .await?,
        day: store
            .count_appointments_starting_between(windows.day.0, windows.day.1)
            .await?,
    };

    Ok(aggregate(&filtered, &departments, &reasons, totals, now))
}
