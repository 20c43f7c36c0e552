use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::record::Entity;
use crate::order::OrderBy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Staff {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub hired_on: Option<NaiveDate>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Entity for Staff {
    const COLLECTION: &'static str = "staff";
    const ORDER: OrderBy = OrderBy::desc("created_at");
}

impl Staff {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            phone: None,
            email: None,
            hired_on: None,
            active: true,
        }
    }
}
