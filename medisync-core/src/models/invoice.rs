use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::record::Entity;
use crate::order::OrderBy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    #[default]
    Unpaid,
    Partial,
    Paid,
    Void,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvoiceItem {
    pub description: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    pub unit_price: f64,
}

fn default_quantity() -> u32 {
    1
}

impl InvoiceItem {
    pub fn new(description: impl Into<String>, quantity: u32, unit_price: f64) -> Self {
        Self {
            description: description.into(),
            quantity,
            unit_price,
        }
    }

    pub fn total(&self) -> f64 {
        f64::from(self.quantity) * self.unit_price
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invoice {
    pub patient_id: String,
    pub patient_name: String,
    pub issued_on: NaiveDate,
    #[serde(default)]
    pub due_on: Option<NaiveDate>,
    #[serde(default)]
    pub items: Vec<InvoiceItem>,
    #[serde(default)]
    pub amount_paid: f64,
    #[serde(default)]
    pub status: InvoiceStatus,
}

impl Entity for Invoice {
    const COLLECTION: &'static str = "invoices";
    const ORDER: OrderBy = OrderBy::desc("issued_on");
}

impl Invoice {
    pub fn new(
        patient_id: impl Into<String>,
        patient_name: impl Into<String>,
        issued_on: NaiveDate,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            patient_name: patient_name.into(),
            issued_on,
            due_on: None,
            items: Vec::new(),
            amount_paid: 0.0,
            status: InvoiceStatus::Unpaid,
        }
    }

    pub fn with_items(mut self, items: Vec<InvoiceItem>) -> Self {
        self.items = items;
        self
    }

    pub fn total(&self) -> f64 {
        self.items.iter().map(InvoiceItem::total).sum()
    }

    /// Amount still owed. Voided invoices owe nothing.
    pub fn balance(&self) -> f64 {
        if self.status == InvoiceStatus::Void {
            return 0.0;
        }
        (self.total() - self.amount_paid).max(0.0)
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, InvoiceStatus::Paid | InvoiceStatus::Void) || self.balance() <= 0.0
    }
}
