//! Task feed example
//!
//! Serves a `tasks` entity from an in-memory store and mutates it every few
//! seconds, so a client subscribed to a live query sees the deltas arrive.
//!
//! ```text
//! cargo run -p livequery-server --example task_feed
//! curl -N http://localhost:8878/api/stream
//! curl -X POST http://localhost:8878/api/stream/query \
//!      -d '{"clientId":"<id>","query":{"entityKey":"tasks","filter":[{"field":"done","op":"eq","value":false}]}}'
//! ```

use livequery_server::{
    init_telemetry, EntityCatalog, EntityDefinition, MemoryStore, Principal, Server,
    TelemetryConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig::new("task-feed"))?;

    let catalog = EntityCatalog::new().with_entity(EntityDefinition::new("tasks"));
    let store = Arc::new(MemoryStore::new(Arc::new(catalog.clone())));
    store.insert("tasks", json!({"id": 1, "title": "write docs", "done": false}))?;

    let runtime = Server::builder()
        .catalog(catalog)
        .memory_store(store.clone())
        .build()?;
    let engine = runtime.engine().clone();

    tokio::spawn(async move {
        let mut next_id = 2;
        let mut ticker = tokio::time::interval(Duration::from_secs(3));
        loop {
            ticker.tick().await;
            let _ = store.insert(
                "tasks",
                json!({"id": next_id, "title": format!("task {}", next_id), "done": false}),
            );
            if next_id > 3 {
                let _ = store.update("tasks", &(next_id - 2).to_string(), json!({"done": true}));
            }
            engine.publish(
                "activity",
                json!({"created": next_id}),
                &Principal::user("feeder"),
            );
            next_id += 1;
        }
    });

    runtime.run().await
}
