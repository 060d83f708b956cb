//! The client's view of the server: one event stream plus the control calls.

use crate::error::{ClientError, Result};
use crate::frame::{SseDecoder, StreamEvent};
use crate::query::Query;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Opens the event stream, optionally asking to resume a previous id.
    async fn open(&self, resume_id: Option<&str>) -> Result<EventStream>;

    async fn subscribe_channel(&self, client_id: &str, channel: &str) -> Result<()>;

    async fn unsubscribe_channel(&self, client_id: &str, channel: &str) -> Result<()>;

    /// Registers a live query and returns its subscription key.
    async fn subscribe_query(&self, client_id: &str, query: &Query) -> Result<String>;

    async fn unsubscribe_query(&self, subscription_key: &str) -> Result<()>;

    /// Returns the ids the server no longer recognizes.
    async fn keep_alive(&self, ids: &[String]) -> Result<Vec<String>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelBody<'a> {
    client_id: &'a str,
    channel: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody<'a> {
    client_id: &'a str,
    query: &'a Query,
}

#[derive(Serialize)]
struct QueryUnsubscribeBody<'a> {
    id: &'a str,
}

#[derive(Deserialize)]
struct QuerySubscribed {
    id: String,
}

/// [`StreamTransport`] over HTTP and Server-Sent Events.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: String,
}

impl HttpTransport {
    /// `base_url` includes the route prefix, e.g. `http://localhost:8878/api`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, route: &str) -> String {
        format!("{}/stream{}", self.base_url, route)
    }

    async fn post<B: Serialize + ?Sized>(&self, route: &str, body: &B, subject: &str) -> Result<reqwest::Response> {
        let response = self.http.post(self.url(route)).json(body).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::FORBIDDEN => Err(ClientError::Forbidden(subject.to_string())),
            StatusCode::NOT_FOUND => Err(ClientError::ConnectionNotFound(subject.to_string())),
            status => Err(ClientError::ConnectionFailed(format!(
                "{} returned {}",
                route, status
            ))),
        }
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(&self, resume_id: Option<&str>) -> Result<EventStream> {
        let mut request = self
            .http
            .get(self.url(""))
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(id) = resume_id {
            request = request.query(&[("clientId", id)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ClientError::ConnectionFailed(format!(
                "stream returned {}",
                response.status()
            )));
        }
        debug!("Event stream opened at {}", self.url(""));

        let mut decoder = SseDecoder::new();
        let events = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => match decoder.push(&bytes) {
                    Ok(events) => stream::iter(events.into_iter().map(Ok).collect::<Vec<_>>()),
                    Err(e) => stream::iter(vec![Err(e)]),
                },
                Err(e) => stream::iter(vec![Err(ClientError::Http(e))]),
            })
            .flatten();
        Ok(events.boxed())
    }

    async fn subscribe_channel(&self, client_id: &str, channel: &str) -> Result<()> {
        self.post("/subscribe", &ChannelBody { client_id, channel }, channel)
            .await
            .map(|_| ())
    }

    async fn unsubscribe_channel(&self, client_id: &str, channel: &str) -> Result<()> {
        self.post("/unsubscribe", &ChannelBody { client_id, channel }, channel)
            .await
            .map(|_| ())
    }

    async fn subscribe_query(&self, client_id: &str, query: &Query) -> Result<String> {
        let response = self
            .post("/query", &QueryBody { client_id, query }, &query.entity_key)
            .await?;
        let subscribed: QuerySubscribed = response.json().await?;
        Ok(subscribed.id)
    }

    async fn unsubscribe_query(&self, subscription_key: &str) -> Result<()> {
        self.post(
            "/query/unsubscribe",
            &QueryUnsubscribeBody {
                id: subscription_key,
            },
            subscription_key,
        )
        .await
        .map(|_| ())
    }

    async fn keep_alive(&self, ids: &[String]) -> Result<Vec<String>> {
        let response = self.post("/keep-alive", ids, "keep-alive").await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_under_base_url() {
        let transport = HttpTransport::new("http://localhost:8878/api/");
        assert_eq!(transport.url(""), "http://localhost:8878/api/stream");
        assert_eq!(
            transport.url("/query/unsubscribe"),
            "http://localhost:8878/api/stream/query/unsubscribe"
        );
    }
}
