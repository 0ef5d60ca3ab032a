/// Client Sessions
///
/// A WebSocket session multiplexes three sources in one loop: frames from
/// the client, frames queued for the client by the hub, and the heartbeat
/// timer. Server-sent-event subscribers get a one-way stream over the same
/// hub queue.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use actix_ws::{CloseCode, CloseReason, Message, MessageStream, Session};
use bytes::Bytes;
use futures_util::Stream;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use crate::core::error::RelayError;
use crate::core::hub::{ConnId, Hub};
use crate::core::protocol::{self, AckFrame, EventFrame, parse_client_frame};
use crate::core::registry::{EventContext, EventRegistry};

/// Timing settings shared by every session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub max_frame_size: usize,
}

/// First frame every client receives.
pub fn welcome_frame(conn_id: &str, server_name: &str) -> EventFrame {
    EventFrame::new("connect", json!({ "id": conn_id, "server": server_name }))
}

/// Error event sent when a frame without an ack id fails.
fn error_frame(event: Option<&str>, error: &RelayError) -> EventFrame {
    EventFrame::new(
        "error",
        json!({
            "event": event,
            "code": error.code(),
            "message": error.to_string(),
        }),
    )
}

/// Process one inbound text frame and return the reply to send, if any.
///
/// Frames with an `id` always get an ack. Frames without one get the
/// handler's result echoed under the same event name when it is not null,
/// or an `error` event when the handler failed.
pub fn handle_text(registry: &EventRegistry, ctx: &EventContext<'_>, text: &str) -> Option<String> {
    let encoded = match parse_client_frame(text) {
        Err(bad) => {
            debug!(conn_id = %ctx.conn_id, error = %bad.error, "rejected frame");
            match bad.id {
                Some(id) => protocol::encode(&AckFrame::err(id, &bad.error)),
                None => protocol::encode(&error_frame(None, &bad.error)),
            }
        }
        Ok(frame) => {
            let result = registry.dispatch(ctx, &frame.event, frame.data);
            if let Err(e) = &result {
                debug!(conn_id = %ctx.conn_id, event = %frame.event, error = %e, "event failed");
            }
            match (frame.id, result) {
                (Some(id), Ok(data)) => protocol::encode(&AckFrame::ok(id, data)),
                (Some(id), Err(e)) => protocol::encode(&AckFrame::err(id, &e)),
                (None, Ok(Value::Null)) => return None,
                (None, Ok(data)) => protocol::encode(&EventFrame::new(frame.event, data)),
                (None, Err(e)) => protocol::encode(&error_frame(Some(frame.event.as_str()), &e)),
            }
        }
    };

    match encoded {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(conn_id = %ctx.conn_id, error = %e, "failed to encode reply");
            None
        }
    }
}

/// Drive one WebSocket connection until it closes, then remove it from the
/// hub.
pub async fn run(
    mut session: Session,
    mut stream: MessageStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    conn_id: ConnId,
    hub: Arc<Hub>,
    registry: Arc<EventRegistry>,
    settings: SessionSettings,
) {
    let mut last_seen = Instant::now();
    let mut heartbeat = interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );

    let close_reason = loop {
        // Queued frames go first so the `connect` welcome precedes any reply.
        tokio::select! {
            biased;

            frame = outbound.recv() => {
                let Some(frame) = frame else { break None };
                if session.text(frame).await.is_err() {
                    break None;
                }
            }

            msg = stream.recv() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(conn_id = %conn_id, error = %e, "websocket protocol error");
                        break Some(CloseReason {
                            code: CloseCode::Protocol,
                            description: Some(e.to_string()),
                        });
                    }
                    None => break None,
                };
                last_seen = Instant::now();

                match msg {
                    Message::Text(text) => {
                        hub.stats.frames_in.fetch_add(1, Ordering::Relaxed);
                        let ctx = EventContext { conn_id: &conn_id, hub: &hub };
                        if let Some(reply) = handle_text(&registry, &ctx, &text)
                            && session.text(reply).await.is_err()
                        {
                            break None;
                        }
                    }
                    Message::Binary(_) | Message::Continuation(_) => {
                        let error = RelayError::InvalidFrame("only unfragmented text frames are supported".to_string());
                        if let Ok(reply) = protocol::encode(&error_frame(None, &error))
                            && session.text(reply).await.is_err()
                        {
                            break None;
                        }
                    }
                    Message::Ping(bytes) => {
                        if session.pong(&bytes).await.is_err() {
                            break None;
                        }
                    }
                    Message::Pong(_) | Message::Nop => {}
                    Message::Close(reason) => {
                        debug!(conn_id = %conn_id, ?reason, "client closed");
                        break reason;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > settings.client_timeout {
                    info!(conn_id = %conn_id, "heartbeat timeout");
                    break Some(CloseReason {
                        code: CloseCode::Policy,
                        description: Some("heartbeat timeout".to_string()),
                    });
                }
                if session.ping(b"").await.is_err() {
                    break None;
                }
            }
        }
    };

    hub.disconnect(&conn_id);
    let _ = session.close(close_reason).await;
}

/// Outbound side of a server-sent-event subscriber. Dropping it (when the
/// HTTP response stream is dropped) disconnects the client.
struct EventStreamState {
    conn_id: ConnId,
    hub: Arc<Hub>,
    receiver: mpsc::UnboundedReceiver<String>,
    keepalive: tokio::time::Interval,
}

impl Drop for EventStreamState {
    fn drop(&mut self) {
        self.hub.disconnect(&self.conn_id);
    }
}

/// SSE body: one `data:` record per queued frame, plus a comment line every
/// `keepalive` so idle proxies keep the connection open.
pub fn event_stream(
    conn_id: ConnId,
    hub: Arc<Hub>,
    receiver: mpsc::UnboundedReceiver<String>,
    keepalive: Duration,
) -> impl Stream<Item = Result<Bytes, Infallible>> + 'static {
    let state = EventStreamState {
        conn_id,
        hub,
        receiver,
        keepalive: interval_at(Instant::now() + keepalive, keepalive),
    };

    futures_util::stream::unfold(state, |mut state| async move {
        let chunk = tokio::select! {
            frame = state.receiver.recv() => match frame {
                Some(frame) => format!("data: {frame}\n\n"),
                None => return None,
            },
            _ = state.keepalive.tick() => ": keep-alive\n\n".to_string(),
        };
        Some((Ok::<_, Infallible>(Bytes::from(chunk)), state))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::hub::{Target, Transport};
    use crate::core::server::{AppState, initialize_events, routes};
    use crate::events;
    use actix_web::{App, web};
    use awc::ws::{Frame, Message as WsMessage};
    use futures::{SinkExt, StreamExt};

    fn registry() -> EventRegistry {
        let mut registry = EventRegistry::new();
        events::echo::register(&mut registry);
        events::rooms::register(&mut registry);
        registry
    }

    fn reply(registry: &EventRegistry, hub: &Hub, conn_id: &str, text: &str) -> Option<Value> {
        let ctx = EventContext { conn_id, hub };
        handle_text(registry, &ctx, text).map(|t| serde_json::from_str(&t).unwrap())
    }

    #[test]
    fn acked_frames_get_ack() {
        let registry = registry();
        let hub = Hub::new();
        let (conn_id, _rx) = hub.connect(Transport::WebSocket);

        let ack = reply(&registry, &hub, &conn_id, r#"{"event":"echo","data":"hi","id":1}"#).unwrap();
        assert_eq!(ack, json!({"ack": 1, "ok": true, "data": "hi"}));

        let ack = reply(&registry, &hub, &conn_id, r#"{"event":"fly","id":"x"}"#).unwrap();
        assert_eq!(ack["ok"], false);
        assert_eq!(ack["error"]["code"], "unknown_event");
    }

    #[test]
    fn unacked_frames_reply_with_event_or_error() {
        let registry = registry();
        let hub = Hub::new();
        let (conn_id, _rx) = hub.connect(Transport::WebSocket);

        let frame = reply(&registry, &hub, &conn_id, r#"{"event":"echo","data":[1,2]}"#).unwrap();
        assert_eq!(frame, json!({"event": "echo", "data": [1, 2]}));

        assert!(reply(&registry, &hub, &conn_id, r#"{"event":"echo"}"#).is_none());

        let frame = reply(&registry, &hub, &conn_id, r#"{"event":"join","data":{}}"#).unwrap();
        assert_eq!(frame["event"], "error");
        assert_eq!(frame["data"]["event"], "join");
        assert_eq!(frame["data"]["code"], "invalid_frame");
    }

    #[test]
    fn malformed_frames() {
        let registry = registry();
        let hub = Hub::new();
        let (conn_id, _rx) = hub.connect(Transport::WebSocket);

        let frame = reply(&registry, &hub, &conn_id, "{oops").unwrap();
        assert_eq!(frame["event"], "error");
        assert_eq!(frame["data"]["event"], Value::Null);

        let ack = reply(&registry, &hub, &conn_id, r#"{"id":9}"#).unwrap();
        assert_eq!(ack["ack"], 9);
        assert_eq!(ack["error"]["code"], "invalid_frame");
    }

    #[test]
    fn welcome_frame_carries_id() {
        let text = protocol::encode(&welcome_frame("abc", "relay")).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"event": "connect", "data": {"id": "abc", "server": "relay"}}));
    }

    #[actix_web::test]
    async fn event_stream_forwards_and_disconnects_on_drop() {
        let hub = Arc::new(Hub::new());
        let (conn_id, rx) = hub.connect(Transport::EventStream);
        let mut stream = Box::pin(event_stream(conn_id, hub.clone(), rx, Duration::from_secs(60)));

        hub.broadcast(&Target::All, &EventFrame::new("tick", json!(1)), None).unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk, Bytes::from("data: {\"event\":\"tick\",\"data\":1}\n\n"));

        assert_eq!(hub.connection_count(), 1);
        drop(stream);
        assert_eq!(hub.connection_count(), 0);
    }

    fn live_state(config: &Config) -> web::Data<AppState> {
        web::Data::new(AppState::new(config, initialize_events()))
    }

    fn start_server(state: web::Data<AppState>) -> actix_test::TestServer {
        actix_test::start(move || App::new().app_data(state.clone()).configure(routes))
    }

    /// Next non-ping frame from the server.
    async fn next_frame<S, E>(ws: &mut S) -> Frame
    where
        S: futures::Stream<Item = Result<Frame, E>> + Unpin,
        E: std::fmt::Debug,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("no frame within 5s")
                .expect("stream ended")
                .unwrap();
            if !matches!(frame, Frame::Ping(_)) {
                return frame;
            }
        }
    }

    /// Disconnects happen on a server worker thread.
    async fn wait_for_disconnect(state: &AppState) {
        for _ in 0..100 {
            if state.hub.connection_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn text_json(frame: Frame) -> Value {
        match frame {
            Frame::Text(bytes) => serde_json::from_slice(&bytes).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[actix_web::test]
    async fn websocket_session_round_trip() {
        let state = live_state(&Config::default());
        let mut srv = start_server(state.clone());
        let mut ws = srv.ws_at("/ws").await.unwrap();

        // Sent before reading anything: the welcome must still arrive first.
        ws.send(WsMessage::Text(r#"{"event":"join","data":{"room":"lobby"},"id":1}"#.into()))
            .await
            .unwrap();

        let welcome = text_json(next_frame(&mut ws).await);
        assert_eq!(welcome["event"], "connect");
        assert_eq!(welcome["data"]["server"], "realtime-server");
        let conn_id = welcome["data"]["id"].as_str().unwrap().to_string();

        let ack = text_json(next_frame(&mut ws).await);
        assert_eq!(ack, json!({"ack": 1, "ok": true, "data": {"room": "lobby", "members": 1}}));
        assert!(state.hub.is_member(&conn_id, "lobby"));

        ws.send(WsMessage::Binary(Bytes::from_static(b"\x00\x01"))).await.unwrap();
        let error = text_json(next_frame(&mut ws).await);
        assert_eq!(error["event"], "error");
        assert_eq!(error["data"]["code"], "invalid_frame");

        ws.send(WsMessage::Ping(Bytes::from_static(b"p"))).await.unwrap();
        assert_eq!(next_frame(&mut ws).await, Frame::Pong(Bytes::from_static(b"p")));

        for n in 1..=3 {
            state
                .hub
                .broadcast(&Target::All, &EventFrame::new("tick", json!(n)), None)
                .unwrap();
        }
        for n in 1..=3 {
            assert_eq!(text_json(next_frame(&mut ws).await), json!({"event": "tick", "data": n}));
        }

        ws.send(WsMessage::Close(None)).await.unwrap();
        assert!(matches!(next_frame(&mut ws).await, Frame::Close(_)));

        wait_for_disconnect(&state).await;
        assert_eq!(state.hub.connection_count(), 0);
        assert_eq!(state.hub.room_count(), 0);
    }

    #[actix_web::test]
    async fn oversize_frame_closes_with_protocol_error() {
        let config = Config {
            max_frame_size: 64,
            ..Config::default()
        };
        let mut srv = start_server(live_state(&config));
        let mut ws = srv.ws_at("/ws").await.unwrap();
        assert_eq!(text_json(next_frame(&mut ws).await)["event"], "connect");

        ws.send(WsMessage::Text("x".repeat(200).into())).await.unwrap();
        match next_frame(&mut ws).await {
            Frame::Close(Some(reason)) => assert_eq!(reason.code, CloseCode::Protocol),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[actix_web::test]
    async fn silent_client_times_out() {
        let config = Config {
            heartbeat_interval: Duration::from_secs(1),
            client_timeout: Duration::from_secs(2),
            ..Config::default()
        };
        let state = live_state(&config);
        let mut srv = start_server(state.clone());
        let mut ws = srv.ws_at("/ws").await.unwrap();
        assert_eq!(text_json(next_frame(&mut ws).await)["event"], "connect");

        // Server pings are skipped and never answered.
        match next_frame(&mut ws).await {
            Frame::Close(Some(reason)) => assert_eq!(reason.code, CloseCode::Policy),
            other => panic!("expected close frame, got {other:?}"),
        }
        wait_for_disconnect(&state).await;
        assert_eq!(state.hub.connection_count(), 0);
    }
}
