//! Local mirror of one live query's result set.

use crate::frame::LiveQueryMessage;
use crate::query::{compare_values, extract_field, Direction, SortField};
use serde_json::Value;
use std::cmp::Ordering;

/// Rows of a live query, kept in the query's sort order.
///
/// `add` behaves as an upsert and `remove` of an unknown id is a no-op, so a
/// batch replayed after a reconnect leaves the view unchanged.
#[derive(Debug, Clone, Default)]
pub struct LiveView {
    id_field: String,
    sort: Vec<SortField>,
    rows: Vec<Value>,
}

impl LiveView {
    pub fn new(sort: Vec<SortField>) -> Self {
        Self {
            id_field: "id".to_string(),
            sort,
            rows: Vec::new(),
        }
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn rows(&self) -> &[Value] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.position(id).map(|i| &self.rows[i])
    }

    pub fn ids(&self) -> Vec<String> {
        self.rows.iter().filter_map(|row| self.id_of(row)).collect()
    }

    pub fn apply(&mut self, message: &LiveQueryMessage) {
        match message {
            LiveQueryMessage::All(rows) => {
                self.rows = rows.clone();
            }
            LiveQueryMessage::Add(row) => self.upsert(None, row.clone()),
            LiveQueryMessage::Replace { old_id, item } => self.upsert(Some(old_id), item.clone()),
            LiveQueryMessage::Remove { id } => {
                if let Some(i) = self.position(id) {
                    self.rows.remove(i);
                }
            }
        }
        self.resort();
    }

    fn upsert(&mut self, old_id: Option<&str>, row: Value) {
        if let Some(old_id) = old_id {
            if let Some(i) = self.position(old_id) {
                self.rows[i] = row;
                return;
            }
        }
        match self.id_of(&row).and_then(|id| self.position(&id)) {
            Some(i) => self.rows[i] = row,
            None => self.rows.push(row),
        }
    }

    fn resort(&mut self) {
        if self.sort.is_empty() {
            return;
        }
        let sort = &self.sort;
        let id_field = &self.id_field;
        self.rows.sort_by(|a, b| {
            for field in sort {
                let cmp = compare_values(&extract_field(a, &field.field), &extract_field(b, &field.field));
                let cmp = match field.direction {
                    Direction::Asc => cmp,
                    Direction::Desc => cmp.reverse(),
                };
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            row_id(a, id_field).cmp(&row_id(b, id_field))
        });
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| self.id_of(row).as_deref() == Some(id))
    }

    fn id_of(&self, row: &Value) -> Option<String> {
        row_id(row, &self.id_field)
    }
}

fn row_id(row: &Value, id_field: &str) -> Option<String> {
    match row.get(id_field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
