use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::{any, get, post},
    Json, Router,
};
use colored::*;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tower_http::trace::TraceLayer;

use crate::protocol::{builtin, PING_FRAME};
use crate::sync::broker::{decode_extras, DEVICE_HEADER, EXTRAS_PARAM, TOKEN_HEADER};

/// Knobs of the mock server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Token required on the channel and on REST calls; open when unset
    pub token: Option<String>,
    /// Delay before answering a `PING` frame with `Pong`
    pub heartbeat_delay: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            token: None,
            heartbeat_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
enum ChannelCommand {
    Frame(String),
    Close { code: u16, reason: String },
}

#[derive(Clone)]
pub struct ServerState {
    options: ServerOptions,
    commands: broadcast::Sender<ChannelCommand>,
    /// Text frames received from clients, in arrival order
    received: Arc<Mutex<Vec<String>>>,
    /// REST calls received, as `VERB /path`
    calls: Arc<Mutex<Vec<String>>>,
    /// Canned REST responses keyed by `service/object[/id]`
    fixtures: Arc<DashMap<String, Value>>,
}

impl ServerState {
    pub fn new(options: ServerOptions) -> Self {
        let (commands, _rx) = broadcast::channel(256);
        Self {
            options,
            commands,
            received: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            fixtures: Arc::new(DashMap::new()),
        }
    }

    pub fn set_fixture(&self, path: &str, body: Value) {
        self.fixtures
            .insert(path.trim_matches('/').to_string(), body);
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    fn authorized(&self, presented: Option<&str>) -> bool {
        match &self.options.token {
            Some(expected) => presented == Some(expected.as_str()),
            None => true,
        }
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(|| async { "RTU mock server" }))
        .route("/health", get(|| async { Json("OK") }))
        .route("/rtu", get(ws_handler))
        .route("/admin/push", post(admin_push))
        .route("/admin/close", post(admin_close))
        .route("/admin/received", get(admin_received))
        .route("/admin/calls", get(admin_calls))
        .route("/admin/fixtures/{*path}", post(admin_fixture))
        .route("/{service}/{object}", any(rest_handler))
        .route("/{service}/{object}/{id}", any(rest_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(port: u16, options: ServerOptions) -> Result<()> {
    let app = router(ServerState::new(options));

    let addr = format!("0.0.0.0:{}", port);
    println!(
        "{} Mock RTU server running at {}",
        "✓".green(),
        format!("http://{}", addr).bright_blue()
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Deserialize)]
struct ChannelQuery {
    token: Option<String>,
}

async fn ws_handler(
    State(state): State<ServerState>,
    Query(query): Query<ChannelQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let authorized = state.authorized(query.token.as_deref());
    ws.on_upgrade(move |socket| handle_ws(state, socket, authorized))
}

async fn handle_ws(state: ServerState, socket: WebSocket, authorized: bool) {
    let (mut sender, mut receiver) = socket.split();

    let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    if !authorized {
        let rejection = json!({
            "Type": "Error",
            "Data": { "Code": 401, "Message": "invalid token", "Type": "SecurityException" }
        });
        let _ = outbound.send(Message::Text(rejection.to_string().into()));
        let _ = outbound.send(Message::Close(Some(CloseFrame {
            code: 1008,
            reason: "unauthorized".into(),
        })));
        drop(outbound);
        let _ = writer.await;
        return;
    }

    let greeting = json!({ "Type": builtin::ALIVE, "Data": {} });
    let _ = outbound.send(Message::Text(greeting.to_string().into()));
    println!("{} Client connected", "↔".bright_blue());

    let mut commands = state.commands.subscribe();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Ok(ChannelCommand::Frame(text)) => {
                    let _ = outbound.send(Message::Text(text.into()));
                }
                Ok(ChannelCommand::Close { code, reason }) => {
                    let _ = outbound.send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })));
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let text = text.to_string();
                    if text == PING_FRAME {
                        let outbound = outbound.clone();
                        let delay = state.options.heartbeat_delay;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let pong = json!({ "Type": builtin::PONG });
                            let _ = outbound.send(Message::Text(pong.to_string().into()));
                        });
                    }
                    state.received.lock().push(text);
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    drop(outbound);
    let _ = writer.await;
    println!("{} Client disconnected", "✗".bright_red());
}

/// Forward a frame (`{"Type": …, "Data": …}`) to every open channel.
async fn admin_push(State(state): State<ServerState>, Json(frame): Json<Value>) -> Json<Value> {
    let delivered = state
        .commands
        .send(ChannelCommand::Frame(frame.to_string()))
        .unwrap_or(0);
    Json(json!({ "delivered": delivered }))
}

#[derive(Deserialize)]
struct CloseQuery {
    code: Option<u16>,
    reason: Option<String>,
}

async fn admin_close(State(state): State<ServerState>, Query(query): Query<CloseQuery>) -> Json<Value> {
    let delivered = state
        .commands
        .send(ChannelCommand::Close {
            code: query.code.unwrap_or(1000),
            reason: query.reason.unwrap_or_default(),
        })
        .unwrap_or(0);
    Json(json!({ "delivered": delivered }))
}

async fn admin_received(State(state): State<ServerState>) -> Json<Vec<String>> {
    Json(state.received())
}

async fn admin_calls(State(state): State<ServerState>) -> Json<Vec<String>> {
    Json(state.calls.lock().clone())
}

async fn admin_fixture(
    State(state): State<ServerState>,
    Path(path): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    state.set_fixture(&path, body);
    StatusCode::NO_CONTENT
}

/// HTTP fallback surface: answers with a fixture when one is set for the
/// path, else echoes what it received.
async fn rest_handler(
    State(state): State<ServerState>,
    method: Method,
    Path(segments): Path<Vec<String>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    let path = segments.join("/");
    state.calls.lock().push(format!("{} /{}", method, path));

    let token = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
    if !state.authorized(token) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    if let Some(fixture) = state.fixtures.get(&path) {
        return Ok(Json(fixture.clone()));
    }

    let extras = match query.get(EXTRAS_PARAM) {
        Some(token) => decode_extras(token).map_err(|_| StatusCode::BAD_REQUEST)?,
        None => Value::Null,
    };
    let body = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
    };
    Ok(Json(json!({
        "Method": method.as_str(),
        "Path": path,
        "Query": query,
        "Extras": extras,
        "Body": body,
        "DeviceId": headers.get(DEVICE_HEADER).and_then(|v| v.to_str().ok()),
    })))
}
