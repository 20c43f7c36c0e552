//! Queue of mutations that did not reach the server.
//!
//! Holds at most one operation per record id, in the order records first
//! entered the queue. Later operations fold into earlier ones:
//!
//! | queued  | then     | result                       |
//! |---------|----------|------------------------------|
//! | -       | create   | create                       |
//! | update  | create   | create with the patch merged |
//! | delete  | create   | nothing                      |
//! | create  | update   | create with the patch merged |
//! | update  | update   | merged update                |
//! | delete  | update   | delete                       |
//! | create  | delete   | nothing                      |
//! | update  | delete   | delete                       |
//!
//! An update or delete queued under a temporary id while its create is
//! still in flight is picked up when the create completes.

use crate::remote::{merge_fields, Fields};

#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    Create { fields: Fields },
    Update { fields: Fields },
    Delete,
}

#[derive(Debug, Default)]
pub struct PendingQueue {
    ops: Vec<(String, PendingOp)>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.ops.iter().position(|(key, _)| key == id)
    }

    pub fn record_create(&mut self, id: &str, mut fields: Fields) {
        let Some(pos) = self.position(id) else {
            self.ops.push((id.to_string(), PendingOp::Create { fields }));
            return;
        };

        let merged = match &self.ops[pos].1 {
            PendingOp::Delete => None,
            PendingOp::Update { fields: patch } => {
                merge_fields(&mut fields, patch.clone());
                Some(fields)
            }
            PendingOp::Create { .. } => Some(fields),
        };
        match merged {
            Some(fields) => self.ops[pos].1 = PendingOp::Create { fields },
            None => {
                self.ops.remove(pos);
            }
        }
    }

    pub fn record_update(&mut self, id: &str, patch: Fields) {
        match self.position(id) {
            Some(pos) => match &mut self.ops[pos].1 {
                PendingOp::Create { fields } | PendingOp::Update { fields } => {
                    merge_fields(fields, patch);
                }
                PendingOp::Delete => {}
            },
            None => self
                .ops
                .push((id.to_string(), PendingOp::Update { fields: patch })),
        }
    }

    /// Queues a delete. Returns true when it cancelled a queued create, in
    /// which case nothing needs to reach the server.
    pub fn record_delete(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(pos) => {
                if matches!(self.ops[pos].1, PendingOp::Create { .. }) {
                    self.ops.remove(pos);
                    true
                } else {
                    self.ops[pos].1 = PendingOp::Delete;
                    false
                }
            }
            None => {
                self.ops.push((id.to_string(), PendingOp::Delete));
                false
            }
        }
    }

    /// Removes and returns the operation queued for `id`.
    pub fn take(&mut self, id: &str) -> Option<PendingOp> {
        self.position(id).map(|pos| self.ops.remove(pos).1)
    }

    /// Removes and returns the patch queued for `id`, if the queued operation
    /// is an update.
    pub fn take_update(&mut self, id: &str) -> Option<Fields> {
        match self.get(id) {
            Some(PendingOp::Update { .. }) => match self.take(id) {
                Some(PendingOp::Update { fields }) => Some(fields),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn get(&self, id: &str) -> Option<&PendingOp> {
        self.position(id).map(|pos| &self.ops[pos].1)
    }

    pub fn has_create(&self, id: &str) -> bool {
        matches!(self.get(id), Some(PendingOp::Create { .. }))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// Removes every queued operation, oldest first.
    pub fn drain(&mut self) -> Vec<(String, PendingOp)> {
        std::mem::take(&mut self.ops)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}
