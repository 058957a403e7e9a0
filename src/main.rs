use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use deadpool_redis::redis::cmd;
use deadpool_redis::{Config, Pool, Runtime};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use courier::config::CourierConfig;
use courier::metrics::Metrics;
use courier::notification::{NotifyRequest, Target};
use courier::protocol::{ClientFrame, ServerFrame};
use courier::registry::ConnectionRegistry;
use courier::repository::RedisRepository;
use courier::service::{IngestionService, ServiceError};
use courier::session::{Channel, SessionDriver, SessionError};
use courier::shutdown::ShutdownSignal;
use courier::workers::{BusRouter, GroupMaintenance, HeartbeatWorker, RetentionTrimmer, TtlJanitor};
use courier::NotificationStore;

use async_trait::async_trait;

struct AppState {
    service: IngestionService,
    sessions: SessionDriver,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
    redis_pool: Pool,
    shutdown: ShutdownSignal,
}

#[tokio::main]
async fn main() {
    // 1. Initialize logging
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    // 2. Load configuration
    let config = match CourierConfig::load() {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            CourierConfig::default()
        }
    };
    let pod_id = config.pod_id();

    // 3. Redis pool + connectivity check
    let cfg = Config::from_url(config.redis.url.clone());
    let pool = cfg
        .create_pool(Some(Runtime::Tokio1))
        .expect("Failed to create Redis pool");

    {
        let mut conn = pool.get().await.expect("Failed to connect to Redis");
        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .expect("Redis PING failed");
    }
    info!(redis = %config.redis.url, pod = %pod_id, "Connected to Redis");

    // 4. Wire the components
    let store: Arc<dyn NotificationStore> = Arc::new(RedisRepository::new(pool.clone()));
    let metrics = Arc::new(Metrics::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let service = IngestionService::new(store.clone());
    let sessions = SessionDriver::new(store.clone(), metrics.clone(), pod_id.clone());
    let shutdown = ShutdownSignal::new();

    // 5. Background workers
    tokio::spawn(TtlJanitor::new(store.clone(), metrics.clone()).run(shutdown.clone()));
    tokio::spawn(GroupMaintenance::new(store.clone(), metrics.clone()).run(shutdown.clone()));
    tokio::spawn(RetentionTrimmer::new(store.clone()).run(shutdown.clone()));
    tokio::spawn(HeartbeatWorker::new(pool.clone(), pod_id.clone()).run(shutdown.clone()));
    tokio::spawn(
        BusRouter::new(pool.clone(), registry.clone(), metrics.clone(), pod_id.clone())
            .run(shutdown.clone()),
    );
    info!("Background workers started");

    let app_state = Arc::new(AppState {
        service,
        sessions,
        registry,
        metrics,
        redis_pool: pool,
        shutdown: shutdown.clone(),
    });

    // 6. HTTP surface
    let app = Router::new()
        .route("/api/v1/notify", post(notify_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server.addr)
        .await
        .expect("Failed to bind server address");
    info!(addr = %config.server.addr, "Courier listening");

    let graceful = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.wait().await })
        .await
        .expect("Server error");

    info!("Courier stopped");
}

/// POST /api/v1/notify
async fn notify_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<NotifyRequest>, JsonRejection>,
) -> Response {
    let Json(mut req) = match body {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Rejected malformed notify request");
            return error_response(StatusCode::BAD_REQUEST, "invalid JSON body");
        }
    };

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // Stamp ingress time when the producer did not supply one
    if req.created_at.is_none() {
        req.created_at = Some(chrono::Utc::now());
    }

    debug!(
        targets = req.targets.len(),
        source = %req.source,
        idempotency_key = ?idempotency_key,
        "Received notify request"
    );

    match state
        .service
        .create_notifications(&req, idempotency_key.as_deref())
        .await
    {
        Ok(response) => (StatusCode::ACCEPTED, Json(response)).into_response(),
        Err(ServiceError::InvalidRequest(msg)) => {
            warn!(reason = %msg, "Rejected invalid notify request");
            error_response(StatusCode::BAD_REQUEST, &msg)
        }
        Err(e) => {
            error!(error = %e, "Failed to create notifications");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

#[derive(Deserialize)]
struct WsParams {
    user_id: i64,
    login: String,
}

/// GET /ws?user_id=<id>&login=<login>
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if params.user_id <= 0 || params.login.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "user_id and login query parameters are required",
        );
    }

    let target = Target::new(params.user_id, params.login);
    ws.on_upgrade(move |socket| handle_socket(state, socket, target))
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket, target: Target) {
    info!(user_id = target.id, login = %target.login, "WebSocket connection established");
    state.metrics.ws_connected();

    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let session_shutdown = ShutdownSignal::new();

    // Process shutdown must also end this session
    let bridge = {
        let session_shutdown = session_shutdown.clone();
        let mut global = state.shutdown.subscribe();
        tokio::spawn(async move {
            let _ = global.recv().await;
            session_shutdown.trigger();
        })
    };

    let conn_id = state
        .registry
        .register(&target, outbound_tx.clone(), session_shutdown.clone())
        .await;

    let writer = tokio::spawn(writer_loop(
        sink,
        outbound_rx,
        session_shutdown.clone(),
    ));

    let channel = SocketChannel {
        outbound: outbound_tx,
        inbound: tokio::sync::Mutex::new(stream),
    };

    if let Err(e) = state
        .sessions
        .run(&target, &channel, &session_shutdown)
        .await
    {
        error!(error = %e, user_id = target.id, login = %target.login, "Session ended with error");
    }

    session_shutdown.trigger();
    state.registry.unregister(&target, conn_id).await;
    let _ = writer.await;
    bridge.abort();

    state.metrics.ws_disconnected();
    info!(user_id = target.id, login = %target.login, "WebSocket connection closed");
}

/// Drains the outbound queue into the socket; the single writer keeps
/// channel writes serialized. A failed write tears the session down.
async fn writer_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<ServerFrame>,
    shutdown: ShutdownSignal,
) {
    let mut stop = shutdown.subscribe();

    loop {
        tokio::select! {
            _ = stop.recv() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };

                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize outbound frame");
                        continue;
                    }
                };

                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(error = %e, "WebSocket write failed, closing session");
                    shutdown.trigger();
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// [`Channel`] over one WebSocket: sends enqueue onto the writer task,
/// receives pull from the read half.
struct SocketChannel {
    outbound: mpsc::UnboundedSender<ServerFrame>,
    inbound: tokio::sync::Mutex<SplitStream<WebSocket>>,
}

#[async_trait]
impl Channel for SocketChannel {
    fn send(&self, frame: ServerFrame) -> Result<(), SessionError> {
        self.outbound
            .send(frame)
            .map_err(|_| SessionError::Transport("outbound channel closed".to_string()))
    }

    async fn recv(&self) -> Result<Option<ClientFrame>, SessionError> {
        let mut stream = self.inbound.lock().await;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(frame) => return Ok(Some(frame)),
                        Err(e) => {
                            debug!(error = %e, "Discarding malformed client frame");
                            continue;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // binary / ping / pong
                Some(Err(e)) => return Err(SessionError::Transport(e.to_string())),
            }
        }
    }
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let mut conn = state.redis_pool.get().await.map_err(|e| {
        error!(error = %e, "Failed to get Redis connection");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let _: String = cmd("PING").query_async(&mut conn).await.map_err(|e| {
        error!(error = %e, "Redis PING failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(json!({
        "status": "ok",
        "redis": "connected",
        "connections": state.registry.client_count().await,
    })))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
