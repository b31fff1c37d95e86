//! Calendar interchange (iCalendar) parsing and event extraction.

mod time;

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tracing::debug;

pub use time::{parse_duration, parse_time_value, TimeValue};

pub const CRATE_NAME: &str = "agenda-ics";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IcsError {
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("line {line}: END:{found} does not close {expected}")]
    UnbalancedEnd {
        line: usize,
        expected: String,
        found: String,
    },
    #[error("component {0} is never closed")]
    Unterminated(String),
    #[error("payload does not contain a VCALENDAR")]
    MissingCalendar,
    #[error("event {key} has no {property}")]
    MissingProperty { key: String, property: &'static str },
    #[error("event {key}: invalid {property} value {value:?}")]
    InvalidValue {
        key: String,
        property: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Event,
    Todo,
    Journal,
    FreeBusy,
    Timezone,
    Alarm,
    Other(String),
}

impl ComponentKind {
    fn from_name(name: &str) -> Self {
        match name {
            "VEVENT" => Self::Event,
            "VTODO" => Self::Todo,
            "VJOURNAL" => Self::Journal,
            "VFREEBUSY" => Self::FreeBusy,
            "VTIMEZONE" => Self::Timezone,
            "VALARM" => Self::Alarm,
            other => Self::Other(other.to_string()),
        }
    }

    fn slug(&self) -> String {
        match self {
            Self::Event => "vevent".into(),
            Self::Todo => "vtodo".into(),
            Self::Journal => "vjournal".into(),
            Self::FreeBusy => "vfreebusy".into(),
            Self::Timezone => "vtimezone".into(),
            Self::Alarm => "valarm".into(),
            Self::Other(name) => name.to_ascii_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub params: Vec<(String, String)>,
    pub value: String,
}

impl Property {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub kind: ComponentKind,
    pub properties: Vec<Property>,
    pub children: Vec<Component>,
}

impl Component {
    fn new(kind: ComponentKind) -> Self {
        Self {
            kind,
            properties: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// TEXT property value with escapes resolved.
    pub fn text(&self, name: &str) -> Option<String> {
        self.property(name).map(|p| unescape_text(&p.value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEntry {
    pub key: String,
    pub component: Component,
}

/// Top-level components of every VCALENDAR in a payload, in file order,
/// keyed by UID (or `<kind>-<index>` when a component has none).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCalendar {
    entries: Vec<CalendarEntry>,
}

impl ParsedCalendar {
    pub fn parse(input: &str) -> Result<Self, IcsError> {
        let mut entries: Vec<CalendarEntry> = Vec::new();
        let mut used_keys: HashSet<String> = HashSet::new();
        let mut stack: Vec<(String, Component)> = Vec::new();
        let mut saw_calendar = false;

        for (line_no, line) in unfold_lines(input) {
            let property = parse_content_line(line_no, &line)?;
            match property.name.as_str() {
                "BEGIN" => {
                    let name = property.value.trim().to_ascii_uppercase();
                    if stack.is_empty() && name != "VCALENDAR" {
                        return Err(IcsError::Malformed {
                            line: line_no,
                            reason: format!("expected BEGIN:VCALENDAR, found BEGIN:{name}"),
                        });
                    }
                    let kind = ComponentKind::from_name(&name);
                    stack.push((name, Component::new(kind)));
                }
                "END" => {
                    let name = property.value.trim().to_ascii_uppercase();
                    let Some((open_name, component)) = stack.pop() else {
                        return Err(IcsError::UnbalancedEnd {
                            line: line_no,
                            expected: "nothing".into(),
                            found: name,
                        });
                    };
                    if open_name != name {
                        return Err(IcsError::UnbalancedEnd {
                            line: line_no,
                            expected: open_name,
                            found: name,
                        });
                    }
                    match stack.last_mut() {
                        Some((_, parent)) => parent.children.push(component),
                        None => {
                            saw_calendar = true;
                            for child in component.children {
                                let key = unique_key(&child, entries.len(), &mut used_keys);
                                entries.push(CalendarEntry {
                                    key,
                                    component: child,
                                });
                            }
                        }
                    }
                }
                _ => match stack.last_mut() {
                    Some((_, component)) => component.properties.push(property),
                    None => {
                        return Err(IcsError::Malformed {
                            line: line_no,
                            reason: format!("property {} outside of VCALENDAR", property.name),
                        })
                    }
                },
            }
        }

        if let Some((name, _)) = stack.pop() {
            return Err(IcsError::Unterminated(name));
        }
        if !saw_calendar {
            return Err(IcsError::MissingCalendar);
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Component> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| &e.component)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CalendarEntry> {
        self.entries.iter()
    }
}

/// A VEVENT reduced to what an appointment needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub key: String,
    pub summary: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// Reads SUMMARY, DTSTART and DTEND from every VEVENT, keeping calendar order.
///
/// Components of any other kind are skipped. Floating and all-day times are
/// interpreted in `default_tz`, as are TZIDs chrono-tz does not know.
pub fn extract_events(calendar: &ParsedCalendar, default_tz: Tz) -> Result<Vec<CalendarEvent>, IcsError> {
    let mut events = Vec::new();
    for entry in calendar.iter() {
        if entry.component.kind != ComponentKind::Event {
            debug!(key = %entry.key, kind = ?entry.component.kind, "skipping non-event component");
            continue;
        }
        events.push(read_event(entry, default_tz)?);
    }
    Ok(events)
}

fn read_event(entry: &CalendarEntry, default_tz: Tz) -> Result<CalendarEvent, IcsError> {
    let component = &entry.component;
    let summary = component.text("SUMMARY").unwrap_or_default();

    let dtstart = component
        .property("DTSTART")
        .ok_or_else(|| IcsError::MissingProperty {
            key: entry.key.clone(),
            property: "DTSTART",
        })?;
    let start = parse_time_value(dtstart, default_tz).ok_or_else(|| IcsError::InvalidValue {
        key: entry.key.clone(),
        property: "DTSTART",
        value: dtstart.value.clone(),
    })?;

    let ends_at = if let Some(dtend) = component.property("DTEND") {
        parse_time_value(dtend, default_tz)
            .ok_or_else(|| IcsError::InvalidValue {
                key: entry.key.clone(),
                property: "DTEND",
                value: dtend.value.clone(),
            })?
            .instant
    } else if let Some(duration) = component.property("DURATION") {
        parse_duration(&duration.value)
            .and_then(|delta| start.instant.checked_add_signed(delta))
            .ok_or_else(|| IcsError::InvalidValue {
                key: entry.key.clone(),
                property: "DURATION",
                value: duration.value.clone(),
            })?
    } else if start.all_day {
        start.instant + Duration::days(1)
    } else {
        start.instant
    };

    Ok(CalendarEvent {
        key: entry.key.clone(),
        summary,
        starts_at: start.instant,
        ends_at,
    })
}

fn unique_key(component: &Component, index: usize, used: &mut HashSet<String>) -> String {
    let base = component
        .property("UID")
        .map(|p| p.value.trim().to_string())
        .filter(|uid| !uid.is_empty())
        .unwrap_or_else(|| format!("{}-{}", component.kind.slug(), index));
    if used.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}#{n}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Joins folded continuation lines; yields (first physical line number, logical line).
fn unfold_lines(input: &str) -> Vec<(usize, String)> {
    let input = input.strip_prefix('\u{feff}').unwrap_or(input);
    let mut out: Vec<(usize, String)> = Vec::new();
    for (idx, raw) in input.lines().enumerate() {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = raw.strip_prefix([' ', '\t']) {
            if let Some((_, last)) = out.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        if raw.trim().is_empty() {
            continue;
        }
        out.push((idx + 1, raw.to_string()));
    }
    // Trailing whitespace only goes once a logical line is complete; a fold
    // may come right after a space that belongs to the value.
    for (_, line) in &mut out {
        line.truncate(line.trim_end().len());
    }
    out
}

fn parse_content_line(line_no: usize, line: &str) -> Result<Property, IcsError> {
    let malformed = |reason: &str| IcsError::Malformed {
        line: line_no,
        reason: reason.to_string(),
    };

    let line = line.trim_start();
    let name_end = line
        .find([';', ':'])
        .ok_or_else(|| malformed("content line has no ':' separator"))?;
    let name = &line[..name_end];
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(malformed("invalid property name"));
    }

    let mut params = Vec::new();
    let mut rest = &line[name_end..];
    while let Some(after) = rest.strip_prefix(';') {
        let eq = after
            .find('=')
            .ok_or_else(|| malformed("parameter without '='"))?;
        let param_name = after[..eq].to_ascii_uppercase();
        let mut value = String::new();
        let mut in_quotes = false;
        let mut consumed = eq + 1;
        for c in after[eq + 1..].chars() {
            match c {
                '"' => in_quotes = !in_quotes,
                ';' | ':' if !in_quotes => break,
                _ => value.push(c),
            }
            consumed += c.len_utf8();
        }
        if in_quotes {
            return Err(malformed("unterminated quoted parameter"));
        }
        params.push((param_name, value));
        rest = &after[consumed..];
    }

    let value = rest
        .strip_prefix(':')
        .ok_or_else(|| malformed("content line has no ':' separator"))?;

    Ok(Property {
        name: name.to_ascii_uppercase(),
        params,
        value: value.to_string(),
    })
}

fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAO_PAULO: Tz = chrono_tz::America::Sao_Paulo;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    #[test]
    fn parses_events_in_file_order_and_drops_other_components() {
        let ics = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
BEGIN:VTIMEZONE\r\n\
TZID:America/Sao_Paulo\r\n\
BEGIN:STANDARD\r\n\
TZOFFSETFROM:-0300\r\n\
TZOFFSETTO:-0300\r\n\
DTSTART:19700101T000000\r\n\
END:STANDARD\r\n\
END:VTIMEZONE\r\n\
BEGIN:VEVENT\r\n\
UID:b\r\n\
SUMMARY:Evento CT - Reunião importante\r\n\
DTSTART:20250301T100000Z\r\n\
DTEND:20250301T110000Z\r\n\
END:VEVENT\r\n\
BEGIN:VTODO\r\n\
SUMMARY:not an appointment\r\n\
END:VTODO\r\n\
BEGIN:VEVENT\r\n\
UID:a\r\n\
SUMMARY:ST - Atendimento técnico\r\n\
DTSTART:20250302T140000Z\r\n\
DTEND:20250302T150000Z\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

        let calendar = ParsedCalendar::parse(ics).unwrap();
        assert_eq!(calendar.len(), 4);
        assert_eq!(calendar.get("vtimezone-0").unwrap().children.len(), 1);

        let events = extract_events(&calendar, SAO_PAULO).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key, "b");
        assert_eq!(events[0].summary, "Evento CT - Reunião importante");
        assert_eq!(events[0].starts_at, utc(2025, 3, 1, 10, 0));
        assert_eq!(events[0].ends_at, utc(2025, 3, 1, 11, 0));
        assert_eq!(events[1].key, "a");
    }

    #[test]
    fn unfolds_lines_and_unescapes_text() {
        let ics = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nSUMMARY:Atendimento\\, CT\n  - retorno\\nsegunda linha\nDTSTART:20250301T100000Z\nEND:VEVENT\nEND:VCALENDAR\n";
        let calendar = ParsedCalendar::parse(ics).unwrap();
        let event = &extract_events(&calendar, SAO_PAULO).unwrap()[0];
        assert_eq!(event.summary, "Atendimento, CT - retorno\nsegunda linha");
        assert_eq!(event.ends_at, event.starts_at);
    }

    #[test]
    fn fold_after_a_space_keeps_the_space() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nSUMMARY:Reunião \r\n CT  \r\nDTSTART:20250301T100000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let calendar = ParsedCalendar::parse(ics).unwrap();
        let event = &extract_events(&calendar, SAO_PAULO).unwrap()[0];
        assert_eq!(event.summary, "Reunião CT");
    }

    #[test]
    fn quoted_parameters_may_contain_separators() {
        let property = parse_content_line(1, "ATTENDEE;CN=\"Silva; João: chefe\";ROLE=CHAIR:mailto:j@x.br").unwrap();
        assert_eq!(property.name, "ATTENDEE");
        assert_eq!(property.param("cn"), Some("Silva; João: chefe"));
        assert_eq!(property.param("ROLE"), Some("CHAIR"));
        assert_eq!(property.value, "mailto:j@x.br");
    }

    #[test]
    fn resolves_tzid_floating_and_all_day_times() {
        let ics = "BEGIN:VCALENDAR
BEGIN:VEVENT
UID:tz
SUMMARY:com fuso
DTSTART;TZID=America/Sao_Paulo:20250301T100000
DTEND;TZID=\"Europe/Lisbon\":20250301T140000
END:VEVENT
BEGIN:VEVENT
UID:floating
SUMMARY:flutuante
DTSTART:20250301T090000
DURATION:PT1H30M
END:VEVENT
BEGIN:VEVENT
UID:day
SUMMARY:dia inteiro
DTSTART;VALUE=DATE:20250305
END:VEVENT
END:VCALENDAR";
        let calendar = ParsedCalendar::parse(ics).unwrap();
        let events = extract_events(&calendar, SAO_PAULO).unwrap();

        assert_eq!(events[0].starts_at, utc(2025, 3, 1, 13, 0));
        assert_eq!(events[0].ends_at, utc(2025, 3, 1, 14, 0));
        assert_eq!(events[1].starts_at, utc(2025, 3, 1, 12, 0));
        assert_eq!(events[1].ends_at, utc(2025, 3, 1, 13, 30));
        assert_eq!(events[2].starts_at, utc(2025, 3, 5, 3, 0));
        assert_eq!(events[2].ends_at, utc(2025, 3, 6, 3, 0));
    }

    #[test]
    fn repeated_uids_get_distinct_keys() {
        let ics = "BEGIN:VCALENDAR
BEGIN:VEVENT
UID:same
DTSTART:20250301T100000Z
END:VEVENT
BEGIN:VEVENT
UID:same
DTSTART:20250301T100000Z
END:VEVENT
END:VCALENDAR
BEGIN:VCALENDAR
BEGIN:VEVENT
DTSTART:20250301T100000Z
END:VEVENT
END:VCALENDAR";
        let calendar = ParsedCalendar::parse(ics).unwrap();
        let keys: Vec<_> = calendar.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["same", "same#2", "vevent-2"]);
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert_eq!(ParsedCalendar::parse(""), Err(IcsError::MissingCalendar));
        assert!(matches!(
            ParsedCalendar::parse("this is not a calendar"),
            Err(IcsError::Malformed { line: 1, .. })
        ));
        assert!(matches!(
            ParsedCalendar::parse("BEGIN:VEVENT\nEND:VEVENT"),
            Err(IcsError::Malformed { line: 1, .. })
        ));
        assert!(matches!(
            ParsedCalendar::parse("BEGIN:VCALENDAR\nBEGIN:VEVENT\nEND:VCALENDAR"),
            Err(IcsError::UnbalancedEnd { line: 3, .. })
        ));
        assert_eq!(
            ParsedCalendar::parse("BEGIN:VCALENDAR\nBEGIN:VEVENT\n"),
            Err(IcsError::Unterminated("VEVENT".into()))
        );
    }

    #[test]
    fn events_need_a_valid_start() {
        let missing = ParsedCalendar::parse("BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:x\nSUMMARY:sem data\nEND:VEVENT\nEND:VCALENDAR").unwrap();
        assert_eq!(
            extract_events(&missing, SAO_PAULO),
            Err(IcsError::MissingProperty {
                key: "x".into(),
                property: "DTSTART"
            })
        );

        let invalid = ParsedCalendar::parse("BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:y\nDTSTART:amanhã\nEND:VEVENT\nEND:VCALENDAR").unwrap();
        assert!(matches!(
            extract_events(&invalid, SAO_PAULO),
            Err(IcsError::InvalidValue { property: "DTSTART", .. })
        ));
    }

    #[test]
    fn oversized_durations_are_invalid_values() {
        for duration in ["PT99999999999999999S", "P999999999W"] {
            let ics = format!(
                "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:d\nDTSTART:20250301T100000Z\nDURATION:{duration}\nEND:VEVENT\nEND:VCALENDAR\n"
            );
            let calendar = ParsedCalendar::parse(&ics).unwrap();
            assert_eq!(
                extract_events(&calendar, SAO_PAULO),
                Err(IcsError::InvalidValue {
                    key: "d".into(),
                    property: "DURATION",
                    value: duration.into(),
                })
            );
        }
    }
}
