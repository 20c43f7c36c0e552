use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::record::Entity;
use crate::order::OrderBy;

/// A stocked supply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryItem {
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub quantity: u32,
    #[serde(default)]
    pub unit: Option<String>,
    /// Stock at or below this level needs reordering
    #[serde(default)]
    pub reorder_level: u32,
    #[serde(default)]
    pub unit_cost: Option<f64>,
    #[serde(default)]
    pub supplier: Option<String>,
}

impl Entity for InventoryItem {
    const COLLECTION: &'static str = "inventory";
    const ORDER: OrderBy = OrderBy::desc("created_at");
}

impl InventoryItem {
    pub fn new(name: impl Into<String>, quantity: u32, reorder_level: u32) -> Self {
        Self {
            name: name.into(),
            category: None,
            quantity,
            unit: None,
            reorder_level,
            unit_cost: None,
            supplier: None,
        }
    }

    pub fn is_low_stock(&self) -> bool {
        self.quantity <= self.reorder_level
    }
}

/// Consumption of an inventory item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub item_id: String,
    pub item_name: String,
    pub quantity: u32,
    pub used_on: NaiveDate,
    #[serde(default)]
    pub used_by: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Entity for UsageRecord {
    const COLLECTION: &'static str = "usage_records";
    const ORDER: OrderBy = OrderBy::desc("used_on");
}

impl UsageRecord {
    pub fn new(
        item_id: impl Into<String>,
        item_name: impl Into<String>,
        quantity: u32,
        used_on: NaiveDate,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            item_name: item_name.into(),
            quantity,
            used_on,
            used_by: None,
            notes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_stock_includes_reorder_level() {
        assert!(InventoryItem::new("Gloves", 10, 10).is_low_stock());
        assert!(InventoryItem::new("Gloves", 3, 10).is_low_stock());
        assert!(!InventoryItem::new("Gloves", 11, 10).is_low_stock());
    }
}
