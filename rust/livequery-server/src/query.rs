//! Query model shared by the registry, the diff engine and the reference store.
//!
//! A [`Query`] selects rows of one entity with a conjunctive filter, an ordered
//! list of sort fields and optional pagination. Its identity ([`Query::query_id`])
//! is a stable hash so that the same query issued twice by one client maps to
//! the same subscription.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dot-separated field path, e.g. `owner.name`
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        let field_val = extract_field(row, &self.field);
        match self.op {
            CompareOp::Eq => field_val == self.value,
            CompareOp::Ne => field_val != self.value,
            CompareOp::Gt => compare_values(&field_val, &self.value) == Ordering::Greater,
            CompareOp::Gte => compare_values(&field_val, &self.value) != Ordering::Less,
            CompareOp::Lt => compare_values(&field_val, &self.value) == Ordering::Less,
            CompareOp::Lte => compare_values(&field_val, &self.value) != Ordering::Greater,
            CompareOp::In => match &self.value {
                Value::Array(candidates) => candidates.contains(&field_val),
                other => *other == field_val,
            },
        }
    }
}

/// Conjunction of conditions. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(Condition::new(field, CompareOp::Eq, value))
    }

    pub fn and(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

impl SortField {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub entity_key: String,
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub sort: Vec<SortField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// 1-based page number, only meaningful together with `limit`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
}

impl Query {
    pub fn new(entity_key: impl Into<String>) -> Self {
        Self {
            entity_key: entity_key.into(),
            filter: Filter::all(),
            sort: Vec::new(),
            limit: None,
            page: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn sort_by(mut self, field: SortField) -> Self {
        self.sort.push(field);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn page(mut self, page: usize) -> Self {
        self.page = Some(page);
        self
    }

    /// Stable identity of entity + filter + sort + pagination.
    pub fn query_id(&self) -> String {
        // Field order of the struct fixes the canonical form.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        hex::encode(&digest[..8])
    }

    /// Orders two rows by the sort fields, falling back to the row ids.
    pub fn compare_rows(&self, a: (&str, &Value), b: (&str, &Value)) -> Ordering {
        for sort in &self.sort {
            let cmp = compare_values(&extract_field(a.1, &sort.field), &extract_field(b.1, &sort.field));
            let cmp = match sort.direction {
                Direction::Asc => cmp,
                Direction::Desc => cmp.reverse(),
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        a.0.cmp(b.0)
    }

    /// Filters, sorts and paginates `(id, row)` pairs.
    pub fn apply(&self, mut rows: Vec<(String, Value)>) -> Vec<(String, Value)> {
        rows.retain(|(_, row)| self.filter.matches(row));
        rows.sort_by(|a, b| self.compare_rows((&a.0, &a.1), (&b.0, &b.1)));

        if let Some(limit) = self.limit {
            // an offset past usize::MAX is past the end of any result
            rows = match self.page.unwrap_or(1).saturating_sub(1).checked_mul(limit) {
                Some(skip) => rows.into_iter().skip(skip).take(limit).collect(),
                None => Vec::new(),
            };
        }
        rows
    }
}

/// Identity of one live-query subscription: `(client_id, query_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub client_id: String,
    pub query_id: String,
}

impl SubscriptionKey {
    pub fn new(client_id: impl Into<String>, query_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            query_id: query_id.into(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (client_id, query_id) = s.rsplit_once(':')?;
        if client_id.is_empty() || query_id.is_empty() {
            return None;
        }
        Some(Self::new(client_id, query_id))
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.query_id)
    }
}

/// Extract a field value from a JSON object using a dot path
pub fn extract_field(value: &Value, path: &str) -> Value {
    let mut current = value;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Compare two JSON values. Null sorts first, numbers before strings.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(a), Value::Number(b)) => {
            let a_f = a.as_f64().unwrap_or(0.0);
            let b_f = b.as_f64().unwrap_or(0.0);
            a_f.partial_cmp(&b_f).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(_), Value::String(_)) => Ordering::Less,
        (Value::String(_), Value::Number(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<(String, Value)> {
        vec![
            ("1".to_string(), json!({"status": "open", "priority": 2})),
            ("2".to_string(), json!({"status": "closed", "priority": 5})),
            ("3".to_string(), json!({"status": "open", "priority": 9})),
            ("4".to_string(), json!({"status": "open", "priority": 2})),
        ]
    }

    #[test]
    fn test_filter_and_sort() {
        let query = Query::new("tasks")
            .filter(Filter::eq("status", "open"))
            .sort_by(SortField::desc("priority"));

        let result = query.apply(rows());
        let ids: Vec<&str> = result.iter().map(|(id, _)| id.as_str()).collect();
        // ties on priority fall back to id order
        assert_eq!(ids, vec!["3", "1", "4"]);
    }

    #[test]
    fn test_pagination() {
        let query = Query::new("tasks")
            .sort_by(SortField::asc("priority"))
            .limit(2)
            .page(2);

        let result = query.apply(rows());
        let ids: Vec<&str> = result.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);
    }

    #[test]
    fn test_huge_page_is_empty() {
        let query = Query::new("tasks").limit(4).page(usize::MAX);
        assert!(query.apply(rows()).is_empty());

        let query = Query::new("tasks").limit(usize::MAX).page(2);
        assert!(query.apply(rows()).is_empty());
    }

    #[test]
    fn test_in_and_range_conditions() {
        let filter = Filter::all()
            .and(Condition::new("status", CompareOp::In, json!(["open", "pending"])))
            .and(Condition::new("priority", CompareOp::Gte, 3));

        assert!(filter.matches(&json!({"status": "open", "priority": 9})));
        assert!(!filter.matches(&json!({"status": "open", "priority": 2})));
        assert!(!filter.matches(&json!({"status": "closed", "priority": 9})));
    }

    #[test]
    fn test_nested_field_path() {
        let filter = Filter::eq("owner.name", "ada");
        assert!(filter.matches(&json!({"owner": {"name": "ada"}})));
        assert!(!filter.matches(&json!({"owner": {"name": "bob"}})));
        assert!(!filter.matches(&json!({"owner": null})));
    }

    #[test]
    fn test_query_id_is_stable_and_distinguishes_queries() {
        let a = Query::new("tasks").filter(Filter::eq("status", "open"));
        let b = Query::new("tasks").filter(Filter::eq("status", "open"));
        let c = Query::new("tasks").filter(Filter::eq("status", "closed"));
        let d = Query::new("notes").filter(Filter::eq("status", "open"));

        assert_eq!(a.query_id(), b.query_id());
        assert_ne!(a.query_id(), c.query_id());
        assert_ne!(a.query_id(), d.query_id());
        assert_eq!(a.query_id().len(), 16);
    }

    #[test]
    fn test_query_wire_format() {
        let json = json!({
            "entityKey": "tasks",
            "filter": [{"field": "status", "op": "eq", "value": "open"}],
            "sort": [{"field": "priority", "direction": "desc"}],
            "limit": 10
        });

        let query: Query = serde_json::from_value(json).unwrap();
        assert_eq!(query.entity_key, "tasks");
        assert_eq!(query.filter, Filter::eq("status", "open"));
        assert_eq!(query.sort, vec![SortField::desc("priority")]);
        assert_eq!(query.limit, Some(10));
        assert!(query.page.is_none());
    }

    #[test]
    fn test_subscription_key_round_trip() {
        let key = SubscriptionKey::new("c1d2-uuid", "abcdef0123456789");
        let parsed = SubscriptionKey::parse(&key.to_string()).unwrap();
        assert_eq!(parsed, key);
        assert!(SubscriptionKey::parse("no-separator").is_none());
    }
}
