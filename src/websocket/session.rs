//! Per-connection lifecycle: `Connecting -> Open -> Closing -> Closed`.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::frame::WsCloseReason;
use super::message::ServerMessage;
use crate::auth::Identity;
use crate::config::WebSocketConfig;
use crate::metrics::WsMetrics;

/// Close code recorded when the transport goes away without a handshake
const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LifecycleState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for LifecycleState {
    fn from(value: u8) -> Self {
        match value {
            0 => LifecycleState::Connecting,
            1 => LifecycleState::Open,
            2 => LifecycleState::Closing,
            _ => LifecycleState::Closed,
        }
    }
}

impl LifecycleState {
    fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Connecting, Open)
                | (Connecting, Closing)
                | (Connecting, Closed)
                | (Open, Closing)
                | (Open, Closed)
                | (Closing, Closed)
        )
    }
}

/// Work handed to the connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Ping,
    Close { code: u16, reason: &'static str },
}

#[derive(Debug, Clone)]
pub struct WsSessionConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub max_missed_pongs: u32,
    pub close_timeout: Duration,
}

impl WsSessionConfig {
    pub fn from_config(config: &WebSocketConfig) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            pong_timeout: config.pong_timeout(),
            max_missed_pongs: config.max_missed_pongs,
            close_timeout: config.close_timeout(),
        }
    }
}

impl Default for WsSessionConfig {
    fn default() -> Self {
        Self::from_config(&WebSocketConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The peer answered our close frame
    Acknowledged,
    /// No answer within `close_timeout`; the connection was torn down anyway
    TimedOut,
    /// Another close was already under way
    AlreadyClosing,
}

impl CloseOutcome {
    pub fn acknowledged(&self) -> bool {
        matches!(self, CloseOutcome::Acknowledged)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub user_id: String,
    pub tier: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub missed_pongs: u32,
    pub compression: bool,
    pub state: LifecycleState,
}

pub struct WebSocketSession {
    id: Uuid,
    identity: Identity,
    created_at: DateTime<Utc>,
    compression: bool,
    config: WsSessionConfig,
    state: AtomicU8,
    opened: AtomicBool,
    close_code: AtomicU16,
    outbound: mpsc::Sender<Outbound>,
    missed_pongs: AtomicU32,
    /// Unix milliseconds of the last ping, 0 before the first one
    last_ping_ms: AtomicI64,
    pongs: watch::Sender<u64>,
    peer_closed: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    heartbeat_stop: watch::Sender<bool>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketSession {
    pub fn new(
        identity: Identity,
        outbound: mpsc::Sender<Outbound>,
        config: WsSessionConfig,
        compression: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            identity,
            created_at: Utc::now(),
            compression,
            config,
            state: AtomicU8::new(LifecycleState::Connecting as u8),
            opened: AtomicBool::new(false),
            close_code: AtomicU16::new(0),
            outbound,
            missed_pongs: AtomicU32::new(0),
            last_ping_ms: AtomicI64::new(0),
            pongs: watch::channel(0).0,
            peer_closed: watch::channel(false).0,
            closed: watch::channel(false).0,
            heartbeat_stop: watch::channel(false).0,
            heartbeat_task: Mutex::new(None),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn tier(&self) -> Option<&str> {
        self.identity.tier.as_deref()
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == LifecycleState::Open
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs.load(Ordering::Acquire)
    }

    /// Close code sent or received, once closed
    pub fn close_code(&self) -> Option<u16> {
        match self.close_code.load(Ordering::Acquire) {
            0 => None,
            code => Some(code),
        }
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        from.can_transition_to(to)
            && self
                .state
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Finish the upgrade. Fails unless the session is still connecting.
    pub fn open(&self) -> bool {
        if !self.transition(LifecycleState::Connecting, LifecycleState::Open) {
            return false;
        }
        self.opened.store(true, Ordering::Release);
        WsMetrics::connection_opened();
        true
    }

    /// Queue a message for the writer task. Dropped unless the session is open.
    pub async fn send(&self, message: ServerMessage) -> bool {
        if !self.is_open() {
            return false;
        }
        self.outbound.send(Outbound::Message(message)).await.is_ok()
    }

    /// Never waits for queue space
    fn try_ping(&self) -> PingSend {
        match self.outbound.try_send(Outbound::Ping) {
            Ok(()) => {
                self.last_ping_ms
                    .store(Utc::now().timestamp_millis(), Ordering::Release);
                PingSend::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => PingSend::QueueFull,
            Err(mpsc::error::TrySendError::Closed(_)) => PingSend::Disconnected,
        }
    }

    pub fn on_pong(&self) {
        self.missed_pongs.store(0, Ordering::Release);
        self.pongs.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Start the ping/pong task. Idempotent.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let Ok(mut slot) = self.heartbeat_task.lock() else {
            return;
        };
        if slot.is_some() || !self.is_open() {
            return;
        }

        let task = tokio::spawn(run_heartbeat(
            Arc::downgrade(self),
            self.heartbeat_stop.subscribe(),
            self.pongs.subscribe(),
            self.config.clone(),
        ));
        *slot = Some(task);
    }

    fn stop_heartbeat(&self) -> Option<JoinHandle<()>> {
        self.heartbeat_stop.send_replace(true);
        self.heartbeat_task.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Server-initiated close: send the close frame once and wait up to
    /// `close_timeout` for the peer's answer before tearing down.
    pub async fn close(&self, reason: WsCloseReason) -> CloseOutcome {
        if !self.transition(LifecycleState::Open, LifecycleState::Closing)
            && !self.transition(LifecycleState::Connecting, LifecycleState::Closing)
        {
            return CloseOutcome::AlreadyClosing;
        }

        if let Some(task) = self.stop_heartbeat() {
            task.abort();
        }

        let code = reason.code();
        let mut acked = self.peer_closed.subscribe();
        let handshake = async {
            let queued = self
                .outbound
                .send(Outbound::Close {
                    code,
                    reason: reason.description(),
                })
                .await
                .is_ok();
            queued && acked.wait_for(|closed| *closed).await.is_ok()
        };
        let acknowledged = matches!(
            tokio::time::timeout(self.config.close_timeout, handshake).await,
            Ok(true)
        );

        self.finish(code);
        tracing::info!(
            connection_id = %self.id,
            user_id = %self.identity.user_id,
            code = code,
            reason = reason.description(),
            acknowledged = acknowledged,
            "WebSocket session closed"
        );

        if acknowledged {
            CloseOutcome::Acknowledged
        } else {
            CloseOutcome::TimedOut
        }
    }

    /// The peer sent a close frame: either the answer to ours or its own close
    pub fn on_peer_close(&self, code: Option<u16>) {
        self.peer_closed.send_replace(true);

        let initiated_by_peer = self.transition(LifecycleState::Open, LifecycleState::Closing)
            || self.transition(LifecycleState::Connecting, LifecycleState::Closing);
        if initiated_by_peer {
            drop(self.stop_heartbeat());
            let code = code.unwrap_or(WsCloseReason::Normal.code());
            self.finish(code);
            tracing::info!(
                connection_id = %self.id,
                user_id = %self.identity.user_id,
                code = code,
                "WebSocket session closed by peer"
            );
        }
    }

    /// Tear down without a handshake (transport error or lost connection)
    pub fn terminate(&self) {
        if self.state() == LifecycleState::Closed {
            return;
        }
        drop(self.stop_heartbeat());
        if self.finish(ABNORMAL_CLOSURE) {
            tracing::debug!(connection_id = %self.id, "WebSocket session terminated");
        }
    }

    fn finish(&self, code: u16) -> bool {
        let previous = LifecycleState::from(
            self.state
                .swap(LifecycleState::Closed as u8, Ordering::AcqRel),
        );
        if previous == LifecycleState::Closed {
            return false;
        }

        self.close_code.store(code, Ordering::Release);
        self.closed.send_replace(true);
        if self.opened.load(Ordering::Acquire) {
            WsMetrics::connection_closed(code);
        }
        true
    }

    /// Resolves once the session reaches `Closed`
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn info(&self) -> ConnectionInfo {
        let last_ping_ms = self.last_ping_ms.load(Ordering::Acquire);
        ConnectionInfo {
            id: self.id,
            user_id: self.identity.user_id.clone(),
            tier: self.identity.tier.clone(),
            created_at: self.created_at,
            last_ping_at: (last_ping_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_ping_ms).single())
                .flatten(),
            missed_pongs: self.missed_pongs(),
            compression: self.compression,
            state: self.state(),
        }
    }
}

enum PingSend {
    Queued,
    QueueFull,
    Disconnected,
}

async fn run_heartbeat(
    session: Weak<WebSocketSession>,
    mut stop: watch::Receiver<bool>,
    mut pongs: watch::Receiver<u64>,
    config: WsSessionConfig,
) {
    let mut ticker = tokio::time::interval(config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }

        let Some(session) = session.upgrade() else {
            break;
        };

        pongs.borrow_and_update();
        match session.try_ping() {
            PingSend::Queued => {}
            // Counts as unanswered once the pong timeout passes
            PingSend::QueueFull => tracing::debug!(
                connection_id = %session.id,
                "Outbound queue full, ping skipped"
            ),
            PingSend::Disconnected => break,
        }

        let answered = tokio::select! {
            _ = stop.changed() => break,
            result = tokio::time::timeout(config.pong_timeout, pongs.changed()) => {
                matches!(result, Ok(Ok(())))
            }
        };
        if answered {
            continue;
        }

        let missed = session.missed_pongs.fetch_add(1, Ordering::AcqRel) + 1;
        WsMetrics::missed_pong();
        tracing::warn!(
            connection_id = %session.id,
            user_id = %session.identity.user_id,
            missed_pongs = missed,
            "No pong within timeout"
        );

        if missed >= config.max_missed_pongs {
            // close() aborts this task, so it must run elsewhere
            tokio::spawn(async move {
                session.close(WsCloseReason::HeartbeatTimeout).await;
            });
            break;
        }
    }
}
