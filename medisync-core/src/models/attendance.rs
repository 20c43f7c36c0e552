use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::record::Entity;
use crate::order::OrderBy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    #[default]
    Present,
    Absent,
    Late,
    Leave,
}

/// One staff member's attendance for a day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attendance {
    pub staff_id: String,
    pub staff_name: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub status: AttendanceStatus,
    #[serde(default)]
    pub check_in: Option<String>,
    #[serde(default)]
    pub check_out: Option<String>,
}

impl Entity for Attendance {
    const COLLECTION: &'static str = "attendance";
    const ORDER: OrderBy = OrderBy::desc("date");
}

impl Attendance {
    pub fn new(
        staff_id: impl Into<String>,
        staff_name: impl Into<String>,
        date: NaiveDate,
    ) -> Self {
        Self {
            staff_id: staff_id.into(),
            staff_name: staff_name.into(),
            date,
            status: AttendanceStatus::Present,
            check_in: None,
            check_out: None,
        }
    }
}
