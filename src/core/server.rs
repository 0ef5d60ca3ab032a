/// HTTP Server Implementation
///
/// This module wires the relay into Actix Web:
/// - HTTP routes for health, metrics, room inspection and server-side emits
/// - WebSocket upgrade into a bidirectional event session
/// - Server-sent-event subscriptions for read-only clients
/// - CORS, security headers, compression and access logging middleware

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use actix_cors::Cors;
use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, Result,
    http::header,
    middleware::{Compress, DefaultHeaders, Logger},
    web,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

use crate::core::config::{AllowedOrigins, Config, CorsConfig};
use crate::core::error::RelayError;
use crate::core::hub::{ConnId, Hub, Target, Transport, validate_room};
use crate::core::protocol::{EventFrame, validate_relay_event};
use crate::core::registry::EventRegistry;
use crate::core::session::{self, SessionSettings, welcome_frame};
use crate::events;

/// Application state shared across all worker threads.
pub struct AppState {
    /// Server name as reported by `/health` and the `connect` frame
    pub server_name: String,
    pub server_version: String,
    pub started_at: Instant,
    pub settings: SessionSettings,
    pub hub: Arc<Hub>,
    pub registry: Arc<EventRegistry>,
    /// Number of `POST /emit` requests served
    pub emit_requests: AtomicU64,
}

impl AppState {
    pub fn new(config: &Config, registry: Arc<EventRegistry>) -> Self {
        Self {
            server_name: config.server_name.clone(),
            server_version: config.server_version.clone(),
            started_at: Instant::now(),
            settings: SessionSettings {
                heartbeat_interval: config.heartbeat_interval,
                client_timeout: config.client_timeout,
                max_frame_size: config.max_frame_size,
            },
            hub: Arc::new(Hub::new()),
            registry,
            emit_requests: AtomicU64::new(0),
        }
    }
}

/// Body of `POST /emit`.
#[derive(Deserialize, Debug)]
pub struct EmitRequest {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub room: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct SubscribeQuery {
    pub room: Option<String>,
}

/// Health check endpoint handler.
///
/// Used by load balancers and monitoring systems to verify server availability.
async fn health(state: web::Data<AppState>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": state.server_name,
        "version": state.server_version,
        "connections": state.hub.connection_count(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    })))
}

async fn metrics_handler(state: web::Data<AppState>) -> Result<HttpResponse> {
    let stats = &state.hub.stats;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "connections": state.hub.connection_count(),
        "rooms": state.hub.room_count(),
        "connections_total": stats.connections_total.load(Ordering::Relaxed),
        "frames_in": stats.frames_in.load(Ordering::Relaxed),
        "frames_out": stats.frames_out.load(Ordering::Relaxed),
        "emit_requests_total": state.emit_requests.load(Ordering::Relaxed),
    })))
}

/// Lists the events a client may send over `/ws`.
async fn list_events(state: web::Data<AppState>) -> Result<HttpResponse> {
    let specs = state.registry.specs();
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "events": specs,
        "count": specs.len(),
    })))
}

async fn list_rooms(state: web::Data<AppState>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "rooms": state.hub.room_summaries(),
    })))
}

async fn room_detail(
    state: web::Data<AppState>,
    room: web::Path<String>,
) -> Result<HttpResponse, RelayError> {
    let room = room.into_inner();
    let members = state
        .hub
        .room_members(&room)
        .ok_or_else(|| RelayError::RoomNotFound(room.clone()))?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "room": room,
        "members": members,
    })))
}

/// Push an event from the server side into a room, or to every client.
///
/// Emitting into a room with no members is not an error; it simply reaches
/// nobody.
async fn emit(
    state: web::Data<AppState>,
    body: web::Json<EmitRequest>,
) -> Result<HttpResponse, RelayError> {
    state.emit_requests.fetch_add(1, Ordering::Relaxed);
    let body = body.into_inner();
    let event = validate_relay_event(&body.event)?;

    let (target, frame) = match body.room {
        Some(room) => {
            let room = validate_room(&room)?;
            let frame = EventFrame::new(event, body.data).in_room(room.as_str());
            (Target::Room(room), frame)
        }
        None => (Target::All, EventFrame::new(event, body.data)),
    };

    let delivered = state.hub.broadcast(&target, &frame, None)?;
    info!(event = %frame.event, ?target, delivered, "server emit");
    Ok(HttpResponse::Ok().json(serde_json::json!({ "delivered": delivered })))
}

/// Register a client, queue its `connect` welcome and optionally join it
/// to `room`. A client that fails any step is disconnected again.
fn open_client(
    state: &AppState,
    transport: Transport,
    room: Option<&str>,
) -> Result<(ConnId, mpsc::UnboundedReceiver<String>), RelayError> {
    let (conn_id, receiver) = state.hub.connect(transport);
    let setup = state
        .hub
        .emit_to(&conn_id, &welcome_frame(&conn_id, &state.server_name))
        .and_then(|_| match room {
            Some(room) => state.hub.join(&conn_id, room).map(|_| ()),
            None => Ok(()),
        });

    if let Err(e) = setup {
        state.hub.disconnect(&conn_id);
        return Err(e);
    }
    Ok((conn_id, receiver))
}

/// Server-Sent Events subscription.
///
/// Registers a one-way client, optionally joined to `?room=`, and streams
/// every frame queued for it. The response is neither cached nor compressed
/// so frames reach the browser as soon as they are written.
async fn sse_subscribe(
    state: web::Data<AppState>,
    query: web::Query<SubscribeQuery>,
) -> Result<HttpResponse, RelayError> {
    let room = query.room.as_deref().map(validate_room).transpose()?;
    let (conn_id, receiver) = open_client(&state, Transport::EventStream, room.as_deref())?;

    let body = session::event_stream(
        conn_id,
        state.hub.clone(),
        receiver,
        state.settings.heartbeat_interval,
    );

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(header::ContentEncoding::Identity)
        .insert_header(header::CacheControl(vec![
            header::CacheDirective::NoCache,
            header::CacheDirective::NoStore,
            header::CacheDirective::MustRevalidate,
        ]))
        // Disable nginx buffering for real-time streaming
        .insert_header(("x-accel-buffering", "no"))
        .streaming(body))
}

/// Upgrade to a WebSocket session.
async fn ws_upgrade(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let (response, ws_session, stream) = actix_ws::handle(&req, body)?;
    let stream = stream.max_frame_size(state.settings.max_frame_size);

    let (conn_id, outbound) = open_client(&state, Transport::WebSocket, None)?;

    actix_web::rt::spawn(session::run(
        ws_session,
        stream,
        outbound,
        conn_id,
        state.hub.clone(),
        state.registry.clone(),
        state.settings,
    ));
    Ok(response)
}

/// Register every route. Shared by the production server and tests.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
        RelayError::InvalidFrame(err.to_string()).into()
    }))
    .route("/health", web::get().to(health))
    .route("/metrics", web::get().to(metrics_handler))
    .route("/events", web::get().to(list_events))
    .route("/rooms", web::get().to(list_rooms))
    .route("/rooms/{room}", web::get().to(room_detail))
    .route("/emit", web::post().to(emit))
    .route("/sse", web::get().to(sse_subscribe))
    .route("/ws", web::get().to(ws_upgrade))
    .route("/", web::get().to(health));
}

/// Build the CORS middleware from configuration.
pub fn build_cors(config: &CorsConfig) -> Cors {
    let mut cors = Cors::default()
        .allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allow_any_header()
        .max_age(config.max_age_secs);

    match &config.origins {
        AllowedOrigins::Any => cors = cors.allow_any_origin().send_wildcard(),
        AllowedOrigins::List(origins) => {
            for origin in origins {
                cors = cors.allowed_origin(origin);
            }
        }
    }
    if config.allow_credentials {
        cors = cors.supports_credentials();
    }
    cors
}

/// Initialize and register all client events.
///
/// Add new event registrations here when implementing additional events.
pub fn initialize_events() -> Arc<EventRegistry> {
    let mut registry = EventRegistry::new();

    events::rooms::register(&mut registry);
    events::relay::register(&mut registry);
    events::echo::register(&mut registry);

    Arc::new(registry)
}

/// Run the relay HTTP server until shutdown.
///
/// The server is configured with:
/// - Worker threads: from configuration (CPU count capped at 16 by default)
/// - Max connections: 10,000 concurrent connections
/// - Connection rate limit: 1,000 connections per second
/// - Keep-alive: 30 seconds
/// - Request timeout: 30 seconds
/// - Shutdown timeout: 10 seconds
pub async fn run_server_http(config: Config) -> std::io::Result<()> {
    let bind_addr = config.bind_addr();
    let state = web::Data::new(AppState::new(&config, initialize_events()));
    let cors_config = config.cors.clone();

    info!(
        name = %config.server_name,
        version = %config.server_version,
        bind = %bind_addr,
        workers = config.workers,
        origins = ?cors_config.origins,
        events = state.registry.specs().len(),
        "realtime server starting"
    );

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            // Enable compression for JSON responses (gzip/brotli)
            .wrap(Compress::default())
            // Add security headers to all responses
            .wrap(
                DefaultHeaders::new()
                    .add(("X-Content-Type-Options", "nosniff"))
                    .add(("X-Frame-Options", "DENY")),
            )
            .wrap(build_cors(&cors_config))
            // Format: %r = request line, %s = status, %Dms = duration in milliseconds
            .wrap(Logger::new("%r %s %Dms"))
            .configure(routes)
    })
    .workers(config.workers)
    // Connection limits for high-traffic scenarios
    .max_connections(10000)
    .max_connection_rate(1000)
    // Timeout configurations to prevent resource exhaustion
    .keep_alive(Duration::from_secs(30))
    .client_request_timeout(Duration::from_secs(30))
    .client_disconnect_timeout(Duration::from_secs(2))
    // Graceful shutdown timeout
    .shutdown_timeout(10)
    .bind(&bind_addr)?
    .run()
    .await
}
