//! HTTP surface: the SSE stream plus the JSON control endpoints.
//!
//! ```text
//! GET  {base}/stream[?clientId=]      text/event-stream
//! POST {base}/stream/subscribe        {clientId, channel}   -> "ok" | 403 | 404
//! POST {base}/stream/unsubscribe      {clientId, channel}   -> "ok" | 403 | 404
//! POST {base}/stream/keep-alive       [ids]                 -> [unknown ids]
//! POST {base}/stream/query            {clientId, query}     -> {"id"} | 403 | 404
//! POST {base}/stream/query/unsubscribe {id}                 -> "ok"
//! GET  /health
//! ```

use crate::auth::PrincipalResolver;
use crate::channel::ChannelSubscribeOutcome;
use crate::engine::LiveQueryEngine;
use crate::error::LiveQueryError;
use crate::query::{Query, SubscriptionKey};
use anyhow::Result;
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, Limited, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::form_urlencoded;

pub type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

const MAX_BODY_BYTES: usize = 1 << 20;
const STREAM_BUFFER: usize = 16;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelRequest {
    client_id: String,
    channel: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    client_id: String,
    query: Query,
}

#[derive(Debug, Deserialize)]
struct QueryUnsubscribeRequest {
    id: String,
}

#[derive(Debug, Serialize)]
struct QuerySubscribed {
    id: String,
}

/// Shared per-request state
pub struct HttpState {
    pub engine: LiveQueryEngine,
    pub resolver: Arc<dyn PrincipalResolver>,
    pub base_path: String,
}

pub struct HttpServer {
    bind_addr: SocketAddr,
    state: Arc<HttpState>,
}

impl HttpServer {
    pub fn new(bind_addr: SocketAddr, state: HttpState) -> Self {
        Self {
            bind_addr,
            state: Arc::new(state),
        }
    }

    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        info!(
            "Live query stream listening on {}{}/stream",
            self.bind_addr, self.state.base_path
        );

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept HTTP connection: {}", e);
                        continue;
                    }
                },
            };

            let io = TokioIo::new(stream);
            let state = self.state.clone();
            let span = info_span!("http.connection", peer = %peer);

            tokio::spawn(
                async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle_request(req, &state).await) }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("HTTP connection error: {}", e);
                    }
                }
                .instrument(span),
            );
        }

        info!("HTTP server stopped accepting connections");
        Ok(())
    }
}

/// Routes one request. Generic over the body so it can be driven without a
/// socket.
pub async fn handle_request<B>(req: Request<B>, state: &HttpState) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let path = req.uri().path().to_string();
    if path == "/health" || path == "/healthz" {
        return text(StatusCode::OK, "OK");
    }

    let Some(route) = path.strip_prefix(state.base_path.as_str()) else {
        return not_found();
    };

    match (req.method().clone(), route) {
        (Method::GET, "/stream") => open_stream(&req, state),
        (Method::POST, "/stream/subscribe") => channel_membership(req, state, false).await,
        (Method::POST, "/stream/unsubscribe") => channel_membership(req, state, true).await,
        (Method::POST, "/stream/keep-alive") => keep_alive(req, state).await,
        (Method::POST, "/stream/query") => subscribe_query(req, state).await,
        (Method::POST, "/stream/query/unsubscribe") => unsubscribe_query(req, state).await,
        _ => not_found(),
    }
}

fn open_stream<B>(req: &Request<B>, state: &HttpState) -> Response<ResponseBody> {
    let requested = req.uri().query().and_then(|q| query_param(q, "clientId"));

    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
    let connection = state.engine.open_stream(tx, requested.as_deref());
    debug!("Streaming to connection {}", connection.id);

    let frames = ReceiverStream::new(rx).map(|bytes| Ok::<_, Infallible>(Frame::data(bytes)));
    let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

async fn channel_membership<B>(
    req: Request<B>,
    state: &HttpState,
    remove: bool,
) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let principal = state.resolver.resolve(req.headers());
    let body: ChannelRequest = match read_json(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let registry = state.engine.registry();
    let outcome = if remove {
        registry.unsubscribe_channel(&body.client_id, &body.channel, &principal)
    } else {
        registry.subscribe_channel(&body.client_id, &body.channel, &principal)
    };

    match outcome {
        ChannelSubscribeOutcome::Ok => json(StatusCode::OK, &"ok"),
        ChannelSubscribeOutcome::Forbidden => text(StatusCode::FORBIDDEN, "Forbidden"),
        ChannelSubscribeOutcome::ConnectionNotFound => not_found(),
    }
}

async fn keep_alive<B>(req: Request<B>, state: &HttpState) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let ids: Vec<String> = match read_json(req).await {
        Ok(ids) => ids,
        Err(response) => return response,
    };

    match state
        .engine
        .registry()
        .keep_alive_and_return_unknown_ids(&ids)
        .await
    {
        Ok(unknown) => json(StatusCode::OK, &unknown),
        Err(e) => error_response(&e),
    }
}

async fn subscribe_query<B>(req: Request<B>, state: &HttpState) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let principal = state.resolver.resolve(req.headers());
    let body: QueryRequest = match read_json(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    match state
        .engine
        .registry()
        .subscribe(&body.client_id, body.query, &principal)
        .await
    {
        Ok(key) => json(
            StatusCode::OK,
            &QuerySubscribed {
                id: key.to_string(),
            },
        ),
        Err(e) => error_response(&e),
    }
}

async fn unsubscribe_query<B>(req: Request<B>, state: &HttpState) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let body: QueryUnsubscribeRequest = match read_json(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let Some(key) = SubscriptionKey::parse(&body.id) else {
        return text(StatusCode::BAD_REQUEST, "Malformed subscription id");
    };

    state.engine.registry().unsubscribe(&key).await;
    json(StatusCode::OK, &"ok")
}

async fn read_json<B, T>(req: Request<B>) -> std::result::Result<T, Response<ResponseBody>>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    T: DeserializeOwned,
{
    let bytes = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            return Err(text(StatusCode::BAD_REQUEST, "Unreadable body"));
        }
    };

    serde_json::from_slice(&bytes).map_err(|e| {
        debug!("Malformed request body: {}", e);
        text(StatusCode::BAD_REQUEST, "Malformed body")
    })
}

fn query_param(query: &str, name: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn error_response(error: &LiveQueryError) -> Response<ResponseBody> {
    match error {
        LiveQueryError::NotFound(_) => not_found(),
        LiveQueryError::Authorization(_) => text(StatusCode::FORBIDDEN, "Forbidden"),
        LiveQueryError::InvalidRow(_) => text(StatusCode::BAD_REQUEST, "Bad Request"),
        LiveQueryError::Conflict(_) => text(StatusCode::CONFLICT, "Conflict"),
        LiveQueryError::TransientStore(_) => {
            text(StatusCode::SERVICE_UNAVAILABLE, "Data store unavailable")
        }
        LiveQueryError::Transport(_) | LiveQueryError::Serialization(_) => {
            error!("Request failed: {}", error);
            text(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

fn not_found() -> Response<ResponseBody> {
    text(StatusCode::NOT_FOUND, "Not Found")
}

fn text(status: StatusCode, body: &'static str) -> Response<ResponseBody> {
    full(status, "text/plain", Bytes::from_static(body.as_bytes()))
}

fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    match serde_json::to_vec(value) {
        Ok(body) => full(status, "application/json", Bytes::from(body)),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

fn full(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(body).boxed_unsync());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
