use serde::{Deserialize, Serialize};

use super::record::Entity;
use crate::order::OrderBy;

/// Clinic-wide settings. Usually a single record per owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub clinic_name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub working_hours: Option<String>,
    #[serde(default)]
    pub appointment_slot_minutes: Option<u32>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Entity for Settings {
    const COLLECTION: &'static str = "settings";
    const ORDER: OrderBy = OrderBy::desc("updated_at");
}

impl Settings {
    pub fn new(clinic_name: impl Into<String>) -> Self {
        Self {
            clinic_name: clinic_name.into(),
            address: None,
            phone: None,
            email: None,
            currency: default_currency(),
            working_hours: None,
            appointment_slot_minutes: None,
        }
    }
}
