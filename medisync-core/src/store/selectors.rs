//! Entity-specific read helpers.

use chrono::NaiveDate;

use super::EntityStore;
use crate::models::{
    Appointment, Attendance, Feedback, InventoryItem, Invoice, Patient, Record, Salary, Staff,
    UsageRecord,
};

impl EntityStore<Patient> {
    /// Case-insensitive substring match on the patient's name.
    pub fn search(&self, query: &str) -> Vec<Record<Patient>> {
        let needle = query.to_lowercase();
        self.select(|r| r.data.name.to_lowercase().contains(&needle))
    }
}

impl EntityStore<Appointment> {
    pub fn for_patient(&self, patient_id: &str) -> Vec<Record<Appointment>> {
        self.select(|r| r.data.patient_id == patient_id)
    }

    pub fn on_date(&self, date: NaiveDate) -> Vec<Record<Appointment>> {
        self.select(|r| r.data.date == date)
    }

    /// Scheduled appointments on or after `today`.
    pub fn upcoming(&self, today: NaiveDate) -> Vec<Record<Appointment>> {
        self.select(|r| r.data.is_open() && r.data.date >= today)
    }
}

impl EntityStore<Invoice> {
    pub fn unpaid(&self) -> Vec<Record<Invoice>> {
        self.select(|r| !r.data.is_settled())
    }

    pub fn for_patient(&self, patient_id: &str) -> Vec<Record<Invoice>> {
        self.select(|r| r.data.patient_id == patient_id)
    }

    pub fn outstanding_balance(&self) -> f64 {
        self.with_records(|records| records.iter().map(|r| r.data.balance()).sum())
    }
}

impl EntityStore<Staff> {
    pub fn active(&self) -> Vec<Record<Staff>> {
        self.select(|r| r.data.active)
    }
}

impl EntityStore<InventoryItem> {
    pub fn low_stock(&self) -> Vec<Record<InventoryItem>> {
        self.select(|r| r.data.is_low_stock())
    }
}

impl EntityStore<UsageRecord> {
    pub fn for_item(&self, item_id: &str) -> Vec<Record<UsageRecord>> {
        self.select(|r| r.data.item_id == item_id)
    }

    /// Total quantity of `item_id` used.
    pub fn total_used(&self, item_id: &str) -> u64 {
        self.with_records(|records| {
            records
                .iter()
                .filter(|r| r.data.item_id == item_id)
                .map(|r| u64::from(r.data.quantity))
                .sum()
        })
    }
}

impl EntityStore<Attendance> {
    pub fn for_staff(&self, staff_id: &str) -> Vec<Record<Attendance>> {
        self.select(|r| r.data.staff_id == staff_id)
    }
}

impl EntityStore<Salary> {
    pub fn for_staff(&self, staff_id: &str) -> Vec<Record<Salary>> {
        self.select(|r| r.data.staff_id == staff_id)
    }
}

impl EntityStore<Feedback> {
    /// Mean rating, or `None` without feedback.
    pub fn average_rating(&self) -> Option<f64> {
        self.with_records(|records| {
            if records.is_empty() {
                return None;
            }
            let total: u32 = records.iter().map(|r| u32::from(r.data.rating)).sum();
            Some(f64::from(total) / records.len() as f64)
        })
    }
}
