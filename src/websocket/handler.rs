use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::compression::{Compressor, InflateError, Payload};
use super::frame::{FrameValidator, FrameVerdict, WsCloseReason};
use super::message::{ClientMessage, ServerMessage};
use super::session::{Outbound, WebSocketSession, WsSessionConfig};
use crate::auth::Identity;
use crate::error::AppError;
use crate::metrics::WsMetrics;
use crate::server::{AppState, ClientIp};

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    /// `deflate` opts in to compressed messages
    pub compression: Option<String>,
}

/// WebSocket upgrade handler
#[tracing::instrument(
    name = "ws.upgrade",
    skip_all,
    fields(has_query_token = query.token.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = extract_token(&query, &headers) else {
        WsMetrics::upgrade_rejected("missing_token");
        state.audit.upgrade_failed("missing token", ip);
        return AppError::Auth("Missing authentication token".to_string()).into_response();
    };

    let identity = match state.token_validator.validate(&token) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(error = %e, "Token validation failed");
            WsMetrics::upgrade_rejected("invalid_token");
            state.audit.upgrade_failed("invalid token", ip);
            return e.into_response();
        }
    };

    let compressor = Compressor::negotiate(
        &state.settings.compression,
        &state.compression_stats,
        query.compression.as_deref(),
    );

    tracing::info!(
        user_id = %identity.user_id,
        compression = compressor.is_some(),
        "WebSocket upgrade requested"
    );

    // Oversized messages must reach the frame validator to be closed with 1009
    let transport_limit = state.settings.websocket.max_frame_size.saturating_mul(2);
    let audit = Arc::clone(&state.audit);

    ws.max_message_size(transport_limit)
        .max_frame_size(transport_limit)
        .on_failed_upgrade(move |e| {
            WsMetrics::upgrade_rejected("handshake");
            audit.upgrade_failed(&format!("handshake failed: {}", e), ip);
        })
        .on_upgrade(move |socket| handle_socket(socket, state, identity, ip, compressor))
}

/// Extract token from query parameter or Authorization header
fn extract_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(ref token) = query.token {
        return Some(token.clone());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.to_string())
}

/// Handle an established WebSocket connection
#[tracing::instrument(
    name = "ws.connection",
    skip_all,
    fields(user_id = %identity.user_id, otel.kind = "server")
)]
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    identity: Identity,
    ip: Option<IpAddr>,
    compressor: Option<Compressor>,
) {
    let ws_config = &state.settings.websocket;
    let (tx, rx) = mpsc::channel(ws_config.outbound_buffer.max(1));
    let session = WebSocketSession::new(
        identity,
        tx,
        WsSessionConfig::from_config(ws_config),
        compressor.is_some(),
    );
    let connection_id = session.id();
    let started = std::time::Instant::now();

    let frames = FrameValidator::from_config(ws_config);
    let (ws_sender, mut ws_receiver) = socket.split();
    let writer = tokio::spawn(run_writer(ws_sender, rx, compressor.clone(), frames));

    session.open();
    state.sessions.register(Arc::clone(&session));
    state
        .audit
        .upgrade_succeeded(session.user_id(), &connection_id.to_string(), ip);
    tracing::info!(
        connection_id = %connection_id,
        user_id = %session.user_id(),
        "WebSocket connection established"
    );

    session
        .send(ServerMessage::Connected {
            connection_id,
            user_id: session.user_id().to_string(),
            compression: session.compression(),
        })
        .await;
    session.start_heartbeat();

    loop {
        tokio::select! {
            _ = session.wait_closed() => break,
            next = ws_receiver.next() => match next {
                Some(Ok(message)) => {
                    on_message(message, &state, &session, compressor.as_ref(), frames, ip).await;
                }
                Some(Err(e)) => {
                    tracing::warn!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                    break;
                }
                None => break,
            }
        }
    }

    state.sessions.remove(connection_id);
    session.terminate();
    writer.abort();

    tracing::info!(
        connection_id = %connection_id,
        user_id = %session.user_id(),
        close_code = ?session.close_code(),
        duration_secs = started.elapsed().as_secs_f64(),
        "WebSocket connection closed"
    );
}

async fn on_message(
    message: Message,
    state: &AppState,
    session: &Arc<WebSocketSession>,
    compressor: Option<&Compressor>,
    frames: FrameValidator,
    ip: Option<IpAddr>,
) {
    match message {
        Message::Text(text) => {
            if accept_frame(session, frames, text.len()) {
                process_text(text.as_str(), state, session, ip).await;
            }
        }
        Message::Binary(data) => {
            if !accept_frame(session, frames, data.len()) {
                return;
            }
            let Some(compressor) = compressor else {
                tracing::warn!(connection_id = %session.id(), "Binary frame on uncompressed connection");
                close_in_background(session, WsCloseReason::ProtocolViolation);
                return;
            };

            match compressor.inflate(&data, frames.max_frame_size()) {
                Ok(text) => process_text(&text, state, session, ip).await,
                Err(e) => {
                    tracing::warn!(connection_id = %session.id(), error = %e, "Failed to inflate message");
                    let reason = match e {
                        InflateError::TooLarge { .. } => WsCloseReason::FrameTooLarge,
                        InflateError::InvalidUtf8 => WsCloseReason::InvalidPayload,
                        InflateError::InvalidData(_) => WsCloseReason::ProtocolViolation,
                    };
                    close_in_background(session, reason);
                }
            }
        }
        Message::Pong(_) => session.on_pong(),
        // Answered by the protocol layer
        Message::Ping(_) => {}
        Message::Close(frame) => session.on_peer_close(frame.map(|f| f.code)),
    }
}

/// Measure an inbound data frame; oversized frames close the session with 1009
fn accept_frame(session: &Arc<WebSocketSession>, frames: FrameValidator, len: usize) -> bool {
    if !session.is_open() {
        return false;
    }

    match frames.check(len) {
        FrameVerdict::Accepted | FrameVerdict::Warning => true,
        FrameVerdict::TooLarge => {
            tracing::warn!(
                connection_id = %session.id(),
                frame_size = len,
                max_frame_size = frames.max_frame_size(),
                "Inbound frame too large"
            );
            close_in_background(session, WsCloseReason::FrameTooLarge);
            false
        }
    }
}

async fn process_text(
    text: &str,
    state: &AppState,
    session: &Arc<WebSocketSession>,
    ip: Option<IpAddr>,
) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => state.router.handle(session, message, ip).await,
        Err(e) => {
            tracing::warn!(connection_id = %session.id(), error = %e, "Malformed client message");
            close_in_background(session, WsCloseReason::ProtocolViolation);
        }
    }
}

/// The read loop keeps running so the peer's close acknowledgment is seen
fn close_in_background(session: &Arc<WebSocketSession>, reason: WsCloseReason) {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        session.close(reason).await;
    });
}

/// Single writer per connection; preserves per-session message order
async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    compressor: Option<Compressor>,
    frames: FrameValidator,
) {
    while let Some(outbound) = rx.recv().await {
        let message = match outbound {
            Outbound::Message(message) => match serde_json::to_string(&message) {
                Ok(text) => {
                    let message = encode_text(text, compressor.as_ref());
                    frames.check_outbound(payload_len(&message));
                    message
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize message");
                    continue;
                }
            },
            Outbound::Ping => Message::Ping(Default::default()),
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        };

        if sink.send(message).await.is_err() {
            break;
        }
    }
}

fn payload_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}

fn encode_text(text: String, compressor: Option<&Compressor>) -> Message {
    let Some(compressor) = compressor else {
        return Message::Text(text.into());
    };

    match compressor.encode(text) {
        Payload::Binary(bytes) => Message::Binary(bytes.into()),
        Payload::Text(text) => Message::Text(text.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompressionConfig, Settings};
    use crate::websocket::{create_test_session, CompressionStats, TestPeer};
    use axum::http::HeaderValue;
    use std::time::Duration;

    #[test]
    fn test_token_from_query_wins() {
        let query = WsQuery {
            token: Some("from-query".to_string()),
            compression: None,
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));

        assert_eq!(extract_token(&query, &headers).as_deref(), Some("from-query"));
    }

    #[test]
    fn test_token_from_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(
            extract_token(&WsQuery::default(), &headers).as_deref(),
            Some("abc.def")
        );

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(extract_token(&WsQuery::default(), &headers).is_none());
        assert!(extract_token(&WsQuery::default(), &HeaderMap::new()).is_none());
    }

    #[test]
    fn test_encode_text_respects_threshold() {
        let config = CompressionConfig {
            enabled: true,
            level: 6,
            threshold: 32,
        };
        let compressor = Compressor::new(&config, Arc::new(CompressionStats::new()));

        assert!(matches!(encode_text("short".to_string(), Some(&compressor)), Message::Text(_)));
        assert!(matches!(
            encode_text("y".repeat(256), Some(&compressor)),
            Message::Binary(_)
        ));
        assert!(matches!(encode_text("y".repeat(256), None), Message::Text(_)));
    }

    #[test]
    fn test_outbound_frames_are_measured_after_encoding() {
        let frames = FrameValidator::new(64, 32);
        let config = CompressionConfig {
            enabled: true,
            level: 9,
            threshold: 32,
        };
        let compressor = Compressor::new(&config, Arc::new(CompressionStats::new()));

        let plain = encode_text("y".repeat(100), None);
        assert_eq!(payload_len(&plain), 100);
        assert_eq!(frames.check_outbound(payload_len(&plain)), FrameVerdict::TooLarge);

        // Compressed payloads are measured as they go on the wire
        let compressed = encode_text("y".repeat(100), Some(&compressor));
        assert!(payload_len(&compressed) < 32);
        assert_eq!(frames.check_outbound(payload_len(&compressed)), FrameVerdict::Accepted);
    }

    fn create_frame_test_state() -> (AppState, FrameValidator) {
        let mut settings = Settings::with_jwt_secret("secret");
        settings.websocket.max_frame_size = 256;
        settings.websocket.warn_threshold = 128;
        let frames = FrameValidator::from_config(&settings.websocket);
        (AppState::new(settings), frames)
    }

    fn create_test_compressor() -> Compressor {
        Compressor::new(&CompressionConfig::default(), Arc::new(CompressionStats::new()))
    }

    fn raw_deflate(data: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    /// Feed one message through the read path and report the close code
    async fn close_code_after(
        message: Message,
        compressor: Option<&Compressor>,
    ) -> Option<u16> {
        let (state, frames) = create_frame_test_state();
        let (session, rx) = create_test_session(8);
        session.open();
        let peer = TestPeer::spawn(&session, rx, true, true);

        on_message(message, &state, &session, compressor, frames, None).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let codes = peer.close_codes().await;
        assert!(codes.len() <= 1);
        assert_eq!(codes.first().copied(), session.close_code());
        session.close_code()
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_above_limit_closes_with_1009() {
        let text = format!("{{\"type\":\"ping\"}}{}", " ".repeat(257 - 15));
        assert_eq!(text.len(), 257);
        assert_eq!(close_code_after(Message::Text(text.into()), None).await, Some(1009));

        let binary = vec![0u8; 257];
        let compressor = create_test_compressor();
        assert_eq!(
            close_code_after(Message::Binary(binary.into()), Some(&compressor)).await,
            Some(1009)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_at_limit_is_accepted() {
        let (state, frames) = create_frame_test_state();
        let (session, rx) = create_test_session(8);
        session.open();
        let peer = TestPeer::spawn(&session, rx, true, true);

        let text = format!("{{\"type\":\"ping\"}}{}", " ".repeat(256 - 15));
        assert_eq!(text.len(), 256);
        on_message(Message::Text(text.into()), &state, &session, None, frames, None).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(session.is_open());
        assert!(peer.close_codes().await.is_empty());
        assert!(peer
            .sent
            .lock()
            .await
            .iter()
            .any(|f| matches!(f, Outbound::Message(ServerMessage::Pong))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_binary_without_compression_closes_with_1002() {
        let data = raw_deflate(br#"{"type":"ping"}"#);
        assert_eq!(close_code_after(Message::Binary(data.into()), None).await, Some(1002));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_json_closes_with_1002() {
        assert_eq!(
            close_code_after(Message::Text("{not json".into()), None).await,
            Some(1002)
        );
        assert_eq!(
            close_code_after(Message::Text(r#"{"type":"teleport"}"#.into()), None).await,
            Some(1002)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_inflated_payload_errors_map_to_close_codes() {
        let compressor = create_test_compressor();

        let invalid_utf8 = raw_deflate(&[0xff, 0xfe, 0xfd]);
        assert_eq!(
            close_code_after(Message::Binary(invalid_utf8.into()), Some(&compressor)).await,
            Some(1007)
        );

        // Small on the wire, larger than the frame limit once inflated
        let bomb = raw_deflate(&[b' '; 4096]);
        assert!(bomb.len() <= 256);
        assert_eq!(
            close_code_after(Message::Binary(bomb.into()), Some(&compressor)).await,
            Some(1009)
        );

        assert_eq!(
            close_code_after(Message::Binary(vec![0xff; 16].into()), Some(&compressor)).await,
            Some(1002)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_compressed_message_is_dispatched() {
        let (state, frames) = create_frame_test_state();
        let (session, rx) = create_test_session(8);
        session.open();
        let peer = TestPeer::spawn(&session, rx, true, true);
        let compressor = create_test_compressor();

        let data = raw_deflate(br#"{"type":"ping"}"#);
        on_message(Message::Binary(data.into()), &state, &session, Some(&compressor), frames, None)
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(session.is_open());
        assert!(peer
            .sent
            .lock()
            .await
            .iter()
            .any(|f| matches!(f, Outbound::Message(ServerMessage::Pong))));
    }
}
