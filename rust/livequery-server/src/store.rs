//! Collaborator boundaries for entity metadata and data access, plus the
//! in-memory reference store used by tests and the demo server.

use crate::auth::{allow_all, Authorizer};
use crate::error::{LiveQueryError, Result};
use crate::query::Query;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Metadata for one entity: how rows are identified and who may read them.
#[derive(Clone)]
pub struct EntityDefinition {
    pub key: String,
    pub id_field: String,
    pub read: Arc<dyn Authorizer>,
}

impl EntityDefinition {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            id_field: "id".to_string(),
            read: allow_all(),
        }
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn with_read(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.read = authorizer;
        self
    }

    /// Primary key of a row, rendered as a string.
    pub fn id_of(&self, row: &Value) -> Option<String> {
        match row.get(&self.id_field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for EntityDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDefinition")
            .field("key", &self.key)
            .field("id_field", &self.id_field)
            .finish()
    }
}

#[derive(Debug, Default, Clone)]
pub struct EntityCatalog {
    entities: HashMap<String, EntityDefinition>,
}

impl EntityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, definition: EntityDefinition) -> Self {
        self.register(definition);
        self
    }

    pub fn register(&mut self, definition: EntityDefinition) {
        self.entities.insert(definition.key.clone(), definition);
    }

    pub fn get(&self, entity_key: &str) -> Result<&EntityDefinition> {
        self.entities
            .get(entity_key)
            .ok_or_else(|| LiveQueryError::NotFound(format!("entity {}", entity_key)))
    }
}

/// Hint passed along with a mutation notification. The diff engine always
/// re-queries; the hint only feeds logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeHint {
    Insert { id: String },
    Update { id: String },
    Delete { id: String },
    Unknown,
}

/// Read side of the data-store adapter.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Rows matching the query, filtered, sorted and paginated.
    async fn find(&self, query: &Query) -> Result<Vec<Value>>;
}

pub type MutationHook = Arc<dyn Fn(&str, ChangeHint) + Send + Sync>;

/// Row tables kept in memory, one per registered entity.
pub struct MemoryStore {
    catalog: Arc<EntityCatalog>,
    tables: RwLock<HashMap<String, Vec<Value>>>,
    on_mutation: RwLock<Option<MutationHook>>,
    failing_reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new(catalog: Arc<EntityCatalog>) -> Self {
        Self {
            catalog,
            tables: RwLock::new(HashMap::new()),
            on_mutation: RwLock::new(None),
            failing_reads: AtomicUsize::new(0),
        }
    }

    /// Invoked after every successful write.
    pub fn set_mutation_hook(&self, hook: MutationHook) {
        *self.on_mutation.write() = Some(hook);
    }

    /// Makes the next `count` reads fail with a transient error.
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Adds a row. Its primary key must be present and unused.
    pub fn insert(&self, entity_key: &str, row: Value) -> Result<String> {
        let definition = self.catalog.get(entity_key)?;
        let id = definition.id_of(&row).ok_or_else(|| {
            LiveQueryError::InvalidRow(format!("{} row without {}", entity_key, definition.id_field))
        })?;
        {
            let mut tables = self.tables.write();
            let rows = tables.entry(entity_key.to_string()).or_default();
            if rows.iter().any(|r| definition.id_of(r).as_deref() == Some(id.as_str())) {
                return Err(LiveQueryError::Conflict(format!("{} {} already exists", entity_key, id)));
            }
            rows.push(row);
        }
        self.notify(entity_key, ChangeHint::Insert { id: id.clone() });
        Ok(id)
    }

    /// Shallow-merges `patch` into the row with the given id. The result must
    /// still carry a primary key that no other row uses.
    pub fn update(&self, entity_key: &str, id: &str, patch: Value) -> Result<()> {
        let definition = self.catalog.get(entity_key)?;
        {
            let mut tables = self.tables.write();
            let rows = tables
                .get_mut(entity_key)
                .ok_or_else(|| LiveQueryError::NotFound(format!("{} {}", entity_key, id)))?;
            let index = rows
                .iter()
                .position(|row| definition.id_of(row).as_deref() == Some(id))
                .ok_or_else(|| LiveQueryError::NotFound(format!("{} {}", entity_key, id)))?;

            let updated = match (patch, &rows[index]) {
                (Value::Object(fields), Value::Object(current)) => {
                    let mut merged = current.clone();
                    merged.extend(fields);
                    Value::Object(merged)
                }
                (replacement, _) => replacement,
            };

            let new_id = definition.id_of(&updated).ok_or_else(|| {
                LiveQueryError::InvalidRow(format!("{} row without {}", entity_key, definition.id_field))
            })?;
            let taken = rows.iter().enumerate().any(|(i, row)| {
                i != index && definition.id_of(row).as_deref() == Some(new_id.as_str())
            });
            if taken {
                return Err(LiveQueryError::Conflict(format!("{} {} already exists", entity_key, new_id)));
            }
            rows[index] = updated;
        }
        self.notify(entity_key, ChangeHint::Update { id: id.to_string() });
        Ok(())
    }

    pub fn delete(&self, entity_key: &str, id: &str) -> Result<()> {
        let definition = self.catalog.get(entity_key)?;
        let removed = {
            let mut tables = self.tables.write();
            match tables.get_mut(entity_key) {
                Some(rows) => {
                    let before = rows.len();
                    rows.retain(|row| definition.id_of(row).as_deref() != Some(id));
                    before != rows.len()
                }
                None => false,
            }
        };
        if !removed {
            return Err(LiveQueryError::NotFound(format!("{} {}", entity_key, id)));
        }
        self.notify(entity_key, ChangeHint::Delete { id: id.to_string() });
        Ok(())
    }

    fn notify(&self, entity_key: &str, hint: ChangeHint) {
        let hook = self.on_mutation.read().clone();
        if let Some(hook) = hook {
            hook(entity_key, hint);
        }
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn find(&self, query: &Query) -> Result<Vec<Value>> {
        let should_fail = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(LiveQueryError::TransientStore(format!(
                "injected read failure on {}",
                query.entity_key
            )));
        }

        let definition = self.catalog.get(&query.entity_key)?;
        let rows: Vec<(String, Value)> = {
            let tables = self.tables.read();
            tables
                .get(&query.entity_key)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| definition.id_of(row).map(|id| (id, row.clone())))
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(query.apply(rows).into_iter().map(|(_, row)| row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Filter, SortField};
    use serde_json::json;
    use std::sync::Mutex;

    fn store() -> MemoryStore {
        let catalog = EntityCatalog::new().with_entity(EntityDefinition::new("tasks"));
        MemoryStore::new(Arc::new(catalog))
    }

    #[tokio::test]
    async fn test_insert_update_delete_and_find() {
        let store = store();
        store.insert("tasks", json!({"id": 1, "status": "open", "rank": 2})).unwrap();
        store.insert("tasks", json!({"id": 2, "status": "open", "rank": 1})).unwrap();
        store.insert("tasks", json!({"id": 3, "status": "done", "rank": 3})).unwrap();

        let query = Query::new("tasks")
            .filter(Filter::eq("status", "open"))
            .sort_by(SortField::asc("rank"));
        let rows = store.find(&query).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], 2);

        store.update("tasks", "1", json!({"status": "done"})).unwrap();
        store.delete("tasks", "2").unwrap();
        assert!(store.find(&query).await.unwrap().is_empty());

        assert!(matches!(
            store.delete("tasks", "2"),
            Err(LiveQueryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_primary_keys_stay_unique() {
        let store = store();
        store.insert("tasks", json!({"id": 1, "v": "a"})).unwrap();
        store.insert("tasks", json!({"id": 2, "v": "b"})).unwrap();

        assert!(matches!(
            store.insert("tasks", json!({"id": 1, "v": "again"})),
            Err(LiveQueryError::Conflict(_))
        ));
        assert!(matches!(
            store.insert("tasks", json!({"v": "anonymous"})),
            Err(LiveQueryError::InvalidRow(_))
        ));
        assert!(matches!(
            store.update("tasks", "2", json!({"id": 1})),
            Err(LiveQueryError::Conflict(_))
        ));
        assert!(matches!(
            store.update("tasks", "2", json!({"v": "no key"})),
            Err(LiveQueryError::InvalidRow(_))
        ));

        let rows = store.find(&Query::new("tasks")).await.unwrap();
        assert_eq!(rows, vec![json!({"id": 1, "v": "a"}), json!({"id": 2, "v": "b"})]);
    }

    #[tokio::test]
    async fn test_unknown_entity_is_not_found() {
        let store = store();
        assert!(matches!(
            store.insert("users", json!({"id": 1})),
            Err(LiveQueryError::NotFound(_))
        ));
        assert!(matches!(
            store.find(&Query::new("users")).await,
            Err(LiveQueryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_read_failures() {
        let store = store();
        store.fail_next_reads(1);
        assert!(matches!(
            store.find(&Query::new("tasks")).await,
            Err(LiveQueryError::TransientStore(_))
        ));
        assert!(store.find(&Query::new("tasks")).await.is_ok());
    }

    #[test]
    fn test_mutation_hook_receives_hints() {
        let store = store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.set_mutation_hook(Arc::new(move |entity, hint| {
            sink.lock().unwrap().push((entity.to_string(), hint));
        }));

        store.insert("tasks", json!({"id": "a"})).unwrap();
        store.update("tasks", "a", json!({"x": 1})).unwrap();
        store.delete("tasks", "a").unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("tasks".to_string(), ChangeHint::Insert { id: "a".into() }),
                ("tasks".to_string(), ChangeHint::Update { id: "a".into() }),
                ("tasks".to_string(), ChangeHint::Delete { id: "a".into() }),
            ]
        );
    }

    #[test]
    fn test_id_of_renders_numbers() {
        let def = EntityDefinition::new("tasks").with_id_field("code");
        assert_eq!(def.id_of(&json!({"code": 42})), Some("42".to_string()));
        assert_eq!(def.id_of(&json!({"code": "x"})), Some("x".to_string()));
        assert_eq!(def.id_of(&json!({"id": 1})), None);
    }
}
