use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::Entity;
use crate::order::OrderBy;

/// A saved report. `data` holds the report body as produced by the generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub title: String,
    pub kind: String,
    #[serde(default)]
    pub period_start: Option<NaiveDate>,
    #[serde(default)]
    pub period_end: Option<NaiveDate>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Entity for Report {
    const COLLECTION: &'static str = "reports";
    const ORDER: OrderBy = OrderBy::desc("created_at");
}

impl Report {
    pub fn new(title: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            kind: kind.into(),
            period_start: None,
            period_end: None,
            summary: None,
            data: Value::Null,
        }
    }
}
