//! Value normalization
//!
//! Drivers hand back numbers, dates and booleans as text more often than not.
//! `normalize_record` coerces scalar text into typed values so every engine
//! produces the same shapes. Pure and total.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use super::types::{Record, Value};

static NUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?[0-9]+(\.[0-9]+)?$").expect("valid numeric pattern"));

static ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$").expect("valid date pattern"));

static ISO_DATETIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[0-9]{4}-[0-9]{2}-[0-9]{2}[T ][0-9]{2}:[0-9]{2}:[0-9]{2}(\.[0-9]+)?(Z|[+-][0-9]{2}:[0-9]{2})?$",
    )
    .expect("valid datetime pattern")
});

static US_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{2}/[0-9]{2}/[0-9]{4}$").expect("valid US date pattern"));

pub fn normalize_record(record: Record) -> Record {
    record
        .into_iter()
        .map(|(name, value)| (name, normalize_value(value)))
        .collect()
}

pub fn normalize_value(value: Value) -> Value {
    match value {
        Value::Text(text) => normalize_text(text),
        other => other,
    }
}

fn normalize_text(text: String) -> Value {
    if NUMERIC.is_match(&text) {
        if let Some(number) = parse_number(&text) {
            return number;
        }
    }

    if let Some(date) = parse_date(&text) {
        return Value::Date(date);
    }

    match text.as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::Text(text),
    }
}

fn parse_number(text: &str) -> Option<Value> {
    if !text.contains('.') {
        if let Ok(int) = text.parse::<i64>() {
            return Some(Value::Int(int));
        }
    }
    text.parse::<f64>().ok().map(Value::Float)
}

fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    if ISO_DATE.is_match(text) {
        return NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(midnight_utc);
    }

    if ISO_DATETIME.is_match(text) {
        let has_offset = text.ends_with('Z') || text[10..].contains(['+', '-']);
        if has_offset {
            return DateTime::parse_from_rfc3339(&text.replacen(' ', "T", 1))
                .ok()
                .map(|dt| dt.with_timezone(&Utc));
        }
        // No offset: read as UTC
        return NaiveDateTime::parse_from_str(&text.replacen(' ', "T", 1), "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc());
    }

    if US_DATE.is_match(text) {
        return NaiveDate::parse_from_str(text, "%m/%d/%Y")
            .ok()
            .and_then(midnight_utc);
    }

    None
}

fn midnight_utc(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc())
}
