use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::debug;

use crate::Property;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeValue {
    pub instant: DateTime<Utc>,
    pub all_day: bool,
}

/// Parses a DATE or DATE-TIME property (DTSTART, DTEND, ...) into a UTC instant.
pub fn parse_time_value(property: &Property, default_tz: Tz) -> Option<TimeValue> {
    let raw = property.value.trim();
    let is_date = property
        .param("VALUE")
        .is_some_and(|v| v.eq_ignore_ascii_case("DATE"))
        || (raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit()));

    if is_date {
        let date = NaiveDate::parse_from_str(raw, "%Y%m%d").ok()?;
        return Some(TimeValue {
            instant: localize(date.and_hms_opt(0, 0, 0)?, default_tz),
            all_day: true,
        });
    }

    if let Some(utc) = raw.strip_suffix(['Z', 'z']) {
        let naive = parse_naive(utc)?;
        return Some(TimeValue {
            instant: Utc.from_utc_datetime(&naive),
            all_day: false,
        });
    }

    let naive = parse_naive(raw)?;
    let tz = property
        .param("TZID")
        .map(|tzid| resolve_tzid(tzid, default_tz))
        .unwrap_or(default_tz);
    Some(TimeValue {
        instant: localize(naive, tz),
        all_day: false,
    })
}

fn parse_naive(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M"))
        .ok()
}

/// IANA names resolve directly; vendor-prefixed ids such as
/// `/mozilla.org/20050126_1/America/Sao_Paulo` resolve by their longest
/// parseable suffix. Anything else falls back to `default_tz`.
fn resolve_tzid(tzid: &str, default_tz: Tz) -> Tz {
    let tzid = tzid.trim().trim_matches('"');
    if let Ok(tz) = tzid.parse::<Tz>() {
        return tz;
    }
    for (idx, _) in tzid.match_indices('/') {
        if let Ok(tz) = tzid[idx + 1..].parse::<Tz>() {
            return tz;
        }
    }
    debug!(tzid, fallback = %default_tz, "unknown TZID, using default zone");
    default_tz
}

/// DST gaps shift forward one hour; overlaps take the earlier instant.
fn localize(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
    }
}

/// RFC 5545 DURATION (`P1W`, `P1DT2H`, `-PT15M`, ...).
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (sign, rest) = match value.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, value.strip_prefix('+').unwrap_or(value)),
    };
    let rest = rest.strip_prefix(['P', 'p'])?;

    let mut total: i64 = 0;
    let mut digits = String::new();
    let mut in_time = false;
    let mut saw_unit = false;
    for c in rest.chars() {
        match c.to_ascii_uppercase() {
            'T' if digits.is_empty() && !in_time => in_time = true,
            d @ '0'..='9' => digits.push(d),
            unit @ ('W' | 'D' | 'H' | 'M' | 'S') => {
                let n: i64 = digits.parse().ok()?;
                digits.clear();
                let seconds = match (unit, in_time) {
                    ('W', false) => 7 * 86_400,
                    ('D', false) => 86_400,
                    ('H', true) => 3_600,
                    ('M', true) => 60,
                    ('S', true) => 1,
                    _ => return None,
                };
                total = total.checked_add(n.checked_mul(seconds)?)?;
                saw_unit = true;
            }
            _ => return None,
        }
    }
    if !digits.is_empty() || !saw_unit {
        return None;
    }
    Duration::try_seconds(sign * total)
}
