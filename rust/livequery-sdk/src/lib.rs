//! # livequery-sdk
//!
//! Rust client for livequery servers.
//!
//! A [`LiveQueryClient`] keeps one server-sent event stream open and
//! multiplexes every live query and channel over it. Live queries are kept as
//! sorted, in-memory views that follow the server's deltas; after a dropped
//! connection the client reconnects with back-off, resumes its identity and
//! reissues its subscriptions.
//!
//! ## Example
//!
//! ```rust,no_run
//! use livequery_sdk::{ClientConfig, Direction, LiveQueryClient, Query};
//!
//! # async fn run() -> livequery_sdk::Result<()> {
//! let client = LiveQueryClient::connect_http("http://localhost:8878/api", ClientConfig::default());
//! client.wait_until_open().await?;
//!
//! let tasks = client
//!     .subscribe(
//!         Query::new("tasks").where_eq("done", false).order_by("title", Direction::Asc),
//!         |items, _change| println!("{} open task(s)", items.len()),
//!     )
//!     .await?;
//!
//! // ...
//! tasks.cancel().await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod error;
mod frame;
mod query;
mod subscription;
mod transport;
mod view;

pub use client::{LiveQueryClient, SubscriptionHandle};
pub use config::ClientConfig;
pub use connection::ConnectionState;
pub use error::{ClientError, Result};
pub use frame::{Envelope, LiveQueryMessage, SseDecoder, StreamEvent};
pub use query::{CompareOp, Condition, Direction, Query, SortField};
pub use subscription::{ChannelCallback, QueryCallback};
pub use transport::{EventStream, HttpTransport, StreamTransport};
pub use view::LiveView;

pub use serde_json::Value;
