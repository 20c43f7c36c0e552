use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::record::Entity;
use crate::order::OrderBy;

/// A salary payment to a staff member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Salary {
    pub staff_id: String,
    pub staff_name: String,
    pub amount: f64,
    /// Pay period, `YYYY-MM`
    pub period: String,
    pub paid_on: NaiveDate,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Entity for Salary {
    const COLLECTION: &'static str = "salaries";
    const ORDER: OrderBy = OrderBy::desc("paid_on");
}

impl Salary {
    pub fn new(
        staff_id: impl Into<String>,
        staff_name: impl Into<String>,
        amount: f64,
        paid_on: NaiveDate,
    ) -> Self {
        Self {
            staff_id: staff_id.into(),
            staff_name: staff_name.into(),
            amount,
            period: paid_on.format("%Y-%m").to_string(),
            paid_on,
            notes: None,
        }
    }
}
