//! # livequery-server
//!
//! Live queries and channel messaging pushed to clients over Server-Sent Events.
//!
//! This crate provides a builder API for creating servers that:
//!
//! - Keep one long-lived event stream per client, with a periodic heartbeat
//! - Re-run subscribed queries when the data-access layer reports a mutation
//!   and push only the difference (`add` / `replace` / `remove`)
//! - Fan out messages published on named channels to authorized subscribers
//! - Let a reconnecting client resume its identifier and catch up
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use livequery_server::{EntityCatalog, EntityDefinition, MemoryStore, Server};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let catalog = EntityCatalog::new().with_entity(EntityDefinition::new("tasks"));
//!     let store = Arc::new(MemoryStore::new(Arc::new(catalog.clone())));
//!
//!     Server::builder()
//!         .catalog(catalog)
//!         .memory_store(store)
//!         .bind("[::]:8878".parse::<std::net::SocketAddr>()?)
//!         .start()
//!         .await
//! }
//! ```

pub mod auth;
pub mod channel;
pub mod config;
pub mod connection;
pub mod diff;
pub mod engine;
pub mod error;
pub mod http;
pub mod message;
pub mod query;
pub mod registry;
pub mod runtime;
pub mod storage;
pub mod store;
pub mod telemetry;

pub use auth::{
    AllowAll, AnonymousResolver, AuthContext, Authorizer, DenyAll, FnAuthorizer, Principal,
    PrincipalResolver, RoleBased,
};
pub use channel::{ChannelPublisher, ChannelSubscribeOutcome};
pub use config::{ServerConfig, StreamConfig};
pub use connection::{Connection, ConnectionId, ConnectionManager, Transport};
pub use diff::{diff, DiffEngine, Snapshot, SnapshotRow};
pub use engine::LiveQueryEngine;
pub use error::{LiveQueryError, Result};
pub use http::{HttpServer, HttpState};
pub use message::{Envelope, LiveQueryMessage, OutboundMessage, StreamEvent};
pub use query::{CompareOp, Condition, Direction, Filter, Query, SortField, SubscriptionKey};
pub use registry::{LiveQuerySubscription, SubscriptionRegistry};
pub use runtime::Runtime;
pub use storage::{InMemorySubscriptionStorage, StoredSubscription, SubscriptionStorage};
pub use store::{ChangeHint, DataStore, EntityCatalog, EntityDefinition, MemoryStore, MutationHook};
pub use telemetry::{init as init_telemetry, TelemetryConfig};

use std::net::SocketAddr;
use std::sync::Arc;

/// Main server interface with fluent builder API
pub struct Server;

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }
}

/// Builder for configuring and creating a live query server
pub struct ServerBuilder {
    config: ServerConfig,
    catalog: EntityCatalog,
    store: Option<Arc<dyn DataStore>>,
    memory_store: Option<Arc<MemoryStore>>,
    channel_authorizer: Arc<dyn Authorizer>,
    storage: Arc<dyn SubscriptionStorage>,
    resolver: Arc<dyn PrincipalResolver>,
}

impl ServerBuilder {
    fn new() -> Self {
        Self {
            config: ServerConfig::new(),
            catalog: EntityCatalog::new(),
            store: None,
            memory_store: None,
            channel_authorizer: auth::allow_all(),
            storage: Arc::new(InMemorySubscriptionStorage::new()),
            resolver: Arc::new(AnonymousResolver),
        }
    }

    /// Entities that may be queried live
    pub fn catalog(mut self, catalog: EntityCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn entity(mut self, definition: EntityDefinition) -> Self {
        self.catalog.register(definition);
        self
    }

    /// Data store the live queries are evaluated against. Mutations must be
    /// reported through [`SubscriptionRegistry::notify_mutation`].
    pub fn store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self.memory_store = None;
        self
    }

    /// In-memory store whose writes are wired to the registry automatically
    pub fn memory_store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = Some(store.clone());
        self.memory_store = Some(store);
        self
    }

    /// Decides who may subscribe to which channel
    pub fn channel_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.channel_authorizer = authorizer;
        self
    }

    pub fn subscription_storage(mut self, storage: Arc<dyn SubscriptionStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn principal_resolver(mut self, resolver: Arc<dyn PrincipalResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn stream_config(mut self, config: StreamConfig) -> Self {
        self.config.stream = config;
        self
    }

    /// Set the bind address for the HTTP/SSE server
    pub fn bind(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.config.stream.bind_address = addr.into();
        self
    }

    pub fn base_path(mut self, base_path: impl Into<String>) -> Self {
        self.config.stream = self.config.stream.with_base_path(base_path);
        self
    }

    /// Assembles the engine without starting anything.
    pub fn build(self) -> anyhow::Result<Runtime> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("a data store is required"))?;

        let engine = LiveQueryEngine::new(
            store,
            Arc::new(self.catalog),
            self.storage,
            self.channel_authorizer,
            &self.config.stream,
        );

        if let Some(memory_store) = self.memory_store {
            memory_store.set_mutation_hook(engine.registry().mutation_hook());
        }

        Ok(Runtime::new(self.config, engine, self.resolver))
    }

    pub async fn start(self) -> anyhow::Result<()> {
        self.build()?.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_requires_store() {
        assert!(Server::builder().build().is_err());
    }

    #[tokio::test]
    async fn test_memory_store_is_wired_to_registry() {
        let catalog = EntityCatalog::new().with_entity(EntityDefinition::new("tasks"));
        let store = Arc::new(MemoryStore::new(Arc::new(catalog.clone())));
        let runtime = Server::builder()
            .catalog(catalog)
            .memory_store(store.clone())
            .build()
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let engine = runtime.engine();
        let conn = engine.open_stream(tx, None);
        engine
            .registry()
            .subscribe(&conn.id, Query::new("tasks"), &Principal::anonymous())
            .await
            .unwrap();

        store.insert("tasks", json!({"id": 1})).unwrap();

        let mut saw_add = false;
        while let Ok(Some(frame)) =
            tokio::time::timeout(std::time::Duration::from_millis(300), rx.recv()).await
        {
            if String::from_utf8_lossy(&frame).contains("\"type\":\"add\"") {
                saw_add = true;
            }
        }
        assert!(saw_add);
    }
}
