//! In-memory ordering of snapshot documents.
//!
//! Live queries are never ordered server-side. Instead every snapshot is
//! sorted here by a date-like field. Values are parsed as RFC 3339
//! timestamps, `YYYY-MM-DD` dates, naive `YYYY-MM-DDTHH:MM:SS` datetimes,
//! integer epoch milliseconds, or `{ "seconds": .. }` timestamp objects.
//!
//! Documents whose field is missing or unparseable are not reordered: they
//! keep their position in the snapshot and the keyed documents are stably
//! sorted around them.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::remote::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Field and direction a collection is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub field: &'static str,
    pub direction: Direction,
}

impl OrderBy {
    pub const fn asc(field: &'static str) -> Self {
        Self {
            field,
            direction: Direction::Ascending,
        }
    }

    pub const fn desc(field: &'static str) -> Self {
        Self {
            field,
            direction: Direction::Descending,
        }
    }
}

/// Parses a date-like value into epoch milliseconds.
pub fn parse_order_key(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => parse_date_str(s),
        Value::Number(n) => n.as_i64(),
        Value::Object(map) => map
            .get("seconds")
            .and_then(Value::as_i64)
            .and_then(|secs| secs.checked_mul(1000)),
        _ => None,
    }
}

fn parse_date_str(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.and_utc().timestamp_millis());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Sorts `docs` in place by `order`.
pub fn sort_documents(docs: &mut Vec<Document>, order: &OrderBy) {
    let mut keyed: Vec<(usize, i64)> = docs
        .iter()
        .enumerate()
        .filter_map(|(i, doc)| doc.get(order.field).and_then(parse_order_key).map(|k| (i, k)))
        .collect();

    let mut is_slot = vec![false; docs.len()];
    for (i, _) in &keyed {
        is_slot[*i] = true;
    }

    // sort_by is stable, so equal keys keep snapshot order
    match order.direction {
        Direction::Ascending => keyed.sort_by(|a, b| a.1.cmp(&b.1)),
        Direction::Descending => keyed.sort_by(|a, b| b.1.cmp(&a.1)),
    }

    let mut source: Vec<Option<Document>> = docs.drain(..).map(Some).collect();
    let mut sorted = keyed.into_iter().map(|(i, _)| i);
    for (pos, slot) in is_slot.into_iter().enumerate() {
        let from = if slot { sorted.next() } else { Some(pos) };
        if let Some(doc) = from.and_then(|i| source[i].take()) {
            docs.push(doc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, fields: Value) -> Document {
        Document::new(id, fields.as_object().cloned().unwrap())
    }

    fn ids(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|d| d.id.as_str()).collect()
    }

    #[test]
    fn test_parse_order_key_formats() {
        let rfc = parse_order_key(&json!("2025-01-15T00:00:00Z")).unwrap();
        let date = parse_order_key(&json!("2025-01-15")).unwrap();
        let naive = parse_order_key(&json!("2025-01-15T00:00:00")).unwrap();
        assert_eq!(rfc, date);
        assert_eq!(rfc, naive);
        assert_eq!(parse_order_key(&json!(1_700_000_000_000i64)), Some(1_700_000_000_000));
        assert_eq!(parse_order_key(&json!({"seconds": 10})), Some(10_000));
        assert_eq!(parse_order_key(&json!("not a date")), None);
        assert_eq!(parse_order_key(&json!(null)), None);
    }

    #[test]
    fn test_sort_descending() {
        let mut docs = vec![
            doc("old", json!({"created_at": "2025-01-01T00:00:00Z"})),
            doc("new", json!({"created_at": "2025-03-01T00:00:00Z"})),
            doc("mid", json!({"created_at": "2025-02-01T00:00:00Z"})),
        ];
        sort_documents(&mut docs, &OrderBy::desc("created_at"));
        assert_eq!(ids(&docs), vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_sort_ascending_dates() {
        let mut docs = vec![
            doc("b", json!({"date": "2025-01-20"})),
            doc("a", json!({"date": "2025-01-10"})),
        ];
        sort_documents(&mut docs, &OrderBy::asc("date"));
        assert_eq!(ids(&docs), vec!["a", "b"]);
    }

    #[test]
    fn test_missing_field_keeps_position() {
        let mut docs = vec![
            doc("k1", json!({"date": "2025-01-03"})),
            doc("none1", json!({})),
            doc("k2", json!({"date": "2025-01-01"})),
            doc("bad", json!({"date": "someday"})),
            doc("k3", json!({"date": "2025-01-02"})),
        ];
        sort_documents(&mut docs, &OrderBy::asc("date"));
        assert_eq!(ids(&docs), vec!["k2", "none1", "k3", "bad", "k1"]);
    }

    #[test]
    fn test_out_of_range_seconds_keep_position() {
        assert_eq!(parse_order_key(&json!({"seconds": i64::MAX})), None);
        assert_eq!(parse_order_key(&json!({"seconds": i64::MIN})), None);

        let mut docs = vec![
            doc("huge", json!({"created_at": {"seconds": i64::MAX}})),
            doc("b", json!({"created_at": "2025-01-01"})),
            doc("a", json!({"created_at": "2025-02-01"})),
        ];
        sort_documents(&mut docs, &OrderBy::desc("created_at"));
        assert_eq!(ids(&docs), vec!["huge", "a", "b"]);
    }

    #[test]
    fn test_equal_keys_are_stable() {
        let mut docs = vec![
            doc("first", json!({"date": "2025-01-01"})),
            doc("second", json!({"date": "2025-01-01"})),
            doc("third", json!({"date": "2025-01-01"})),
        ];
        sort_documents(&mut docs, &OrderBy::desc("date"));
        assert_eq!(ids(&docs), vec!["first", "second", "third"]);
    }
}
