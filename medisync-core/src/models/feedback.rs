use serde::{Deserialize, Serialize};

use super::record::Entity;
use crate::order::OrderBy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feedback {
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub patient_name: Option<String>,
    /// 1 to 5
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
}

impl Entity for Feedback {
    const COLLECTION: &'static str = "feedback";
    const ORDER: OrderBy = OrderBy::desc("created_at");
}

impl Feedback {
    pub fn new(rating: u8) -> Self {
        Self {
            patient_id: None,
            patient_name: None,
            rating: rating.clamp(1, 5),
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}
