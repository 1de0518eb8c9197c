//! Canvas hub: the single task that owns all mutable canvas state.
//!
//! ARCHITECTURE
//! ============
//! `Hub` owns the stroke log, the session registry, the rate limiter and the
//! segment batcher. It runs on one tokio task and is driven by `HubCommand`s
//! sent through a bounded queue. Socket tasks hold a cloneable `HubHandle`;
//! timers hold one too. Nothing else touches hub state, so there are no locks.
//!
//! Each command is handled to completion in one turn: state changes first,
//! then the resulting frames are fanned out. Fan-out uses `try_send` on each
//! session's outbound queue so a slow client can never stall the hub. A full
//! queue drops that frame for that client.
//!
//! Replies the caller must wait for (connect, snapshot, stats) travel back on
//! oneshot channels.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::HubTuning;
use crate::frame::{Data, Frame, now_ms};
use crate::protocol::{self, Inbound};
use crate::rate_limit::RateLimiter;
use crate::services::batcher::{SegmentBatch, SegmentBatcher};
use crate::services::canvas::CanvasStore;
use crate::services::persistence::CanvasSnapshot;
use crate::services::session::{Session, SessionManager};
use crate::state::{ConnectionId, ServerStats, Stroke};

/// Capacity of the command queue into the hub.
pub const HUB_QUEUE_CAPACITY: usize = 4096;

/// Capacity of each session's outbound frame queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Most `item` frames one progressive reply may queue. Half the outbound
/// queue, so the reply and its `done` fit even when other frames are waiting.
pub const MAX_PROGRESSIVE_CHUNKS: usize = OUTBOUND_QUEUE_CAPACITY / 2;

// =============================================================================
// COMMANDS
// =============================================================================

#[derive(Debug)]
pub enum HubCommand {
    Connect {
        connection_id: ConnectionId,
        requested_identity: Option<String>,
        sender: mpsc::Sender<Frame>,
        reply: oneshot::Sender<Result<SessionAssigned, ConnectError>>,
    },
    Event {
        connection_id: ConnectionId,
        inbound: Inbound,
    },
    /// Transport-level ping.
    Heartbeat {
        connection_id: ConnectionId,
    },
    Disconnect {
        connection_id: ConnectionId,
    },
    SweepSessions,
    SweepRateLimits,
    FlushBatches,
    Snapshot {
        reply: oneshot::Sender<CanvasSnapshot>,
    },
    Stats {
        reply: oneshot::Sender<ServerStats>,
    },
}

/// Identity handed to a newly connected session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAssigned {
    pub identity: String,
    pub display_name: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection limit reached ({limit})")]
    ConnectionLimit { limit: usize },
    #[error("canvas hub is not running")]
    HubClosed,
}

/// Where a frame produced by a handler goes.
#[derive(Debug)]
pub(crate) enum Delivery {
    /// Back to the originating session only.
    Reply(Frame),
    /// Every session except the origin.
    Peers(Frame),
    /// Every session, origin included.
    Everyone(Frame),
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cloneable sender side of the hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Register a connection. Frames for it arrive on `sender`'s receiver.
    ///
    /// # Errors
    ///
    /// `ConnectionLimit` when the server is full, `HubClosed` if the hub is gone.
    pub async fn connect(
        &self,
        connection_id: ConnectionId,
        requested_identity: Option<String>,
        sender: mpsc::Sender<Frame>,
    ) -> Result<SessionAssigned, ConnectError> {
        let (reply, rx) = oneshot::channel();
        let cmd = HubCommand::Connect { connection_id, requested_identity, sender, reply };
        if !self.send(cmd).await {
            return Err(ConnectError::HubClosed);
        }
        rx.await.unwrap_or(Err(ConnectError::HubClosed))
    }

    pub async fn event(&self, connection_id: ConnectionId, inbound: Inbound) {
        self.send(HubCommand::Event { connection_id, inbound }).await;
    }

    pub async fn heartbeat(&self, connection_id: ConnectionId) {
        self.send(HubCommand::Heartbeat { connection_id }).await;
    }

    pub async fn disconnect(&self, connection_id: ConnectionId) {
        self.send(HubCommand::Disconnect { connection_id }).await;
    }

    /// Copy of the current canvas. `None` once the hub has stopped.
    pub async fn snapshot(&self) -> Option<CanvasSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.send(HubCommand::Snapshot { reply }).await {
            return None;
        }
        rx.await.ok()
    }

    pub async fn stats(&self) -> Option<ServerStats> {
        let (reply, rx) = oneshot::channel();
        if !self.send(HubCommand::Stats { reply }).await {
            return None;
        }
        rx.await.ok()
    }

    /// Queue a command. False when the hub has stopped.
    pub async fn send(&self, cmd: HubCommand) -> bool {
        self.tx.send(cmd).await.is_ok()
    }
}

// =============================================================================
// HUB
// =============================================================================

#[derive(Debug)]
pub struct Hub {
    pub(crate) canvas: CanvasStore,
    pub(crate) sessions: SessionManager,
    pub(crate) limiter: RateLimiter,
    pub(crate) batcher: SegmentBatcher,
    pub(crate) tuning: HubTuning,
    persist_tx: Option<mpsc::Sender<CanvasSnapshot>>,
}

impl Hub {
    /// Build a hub, optionally seeded from a saved snapshot. `persist_tx`
    /// receives snapshots that must be written right away.
    #[must_use]
    pub fn new(
        tuning: HubTuning,
        restored: Option<CanvasSnapshot>,
        persist_tx: Option<mpsc::Sender<CanvasSnapshot>>,
    ) -> Self {
        let mut canvas = CanvasStore::new(tuning.max_strokes);
        if let Some(snapshot) = restored {
            let dropped = canvas.restore(snapshot);
            if dropped > 0 {
                warn!(dropped, capacity = canvas.capacity(), "snapshot over capacity; oldest strokes dropped");
            }
            info!(strokes = canvas.len(), "canvas restored");
        }

        Self {
            canvas,
            sessions: SessionManager::new(tuning.heartbeat_timeout, tuning.inactivity_timeout),
            limiter: RateLimiter::new(),
            batcher: SegmentBatcher::new(tuning.batch_size, tuning.batch_timeout),
            tuning,
            persist_tx,
        }
    }

    /// Apply one command at `now`.
    pub fn handle(&mut self, cmd: HubCommand, now: Instant) {
        match cmd {
            HubCommand::Connect { connection_id, requested_identity, sender, reply } => {
                let result = self.connect(connection_id, requested_identity.as_deref(), sender, now);
                // Receiver gone means the socket closed mid-handshake.
                if reply.send(result).is_err() {
                    self.disconnect(connection_id);
                }
            }
            HubCommand::Event { connection_id, inbound } => {
                let deliveries = self.on_event(connection_id, inbound, now);
                self.deliver(connection_id, deliveries);
            }
            HubCommand::Heartbeat { connection_id } => {
                self.sessions.touch_heartbeat(connection_id, now);
            }
            HubCommand::Disconnect { connection_id } => self.disconnect(connection_id),
            HubCommand::SweepSessions => self.sweep_sessions(now),
            HubCommand::SweepRateLimits => {
                let dropped = self.limiter.sweep(now);
                if dropped > 0 {
                    debug!(dropped, tracked = self.limiter.tracked_connections(), "rate limit entries swept");
                }
            }
            HubCommand::FlushBatches => {
                for batch in self.batcher.due(now) {
                    let origin = batch.connection_id;
                    self.deliver(origin, vec![Delivery::Peers(segments_frame(batch))]);
                }
            }
            HubCommand::Snapshot { reply } => {
                let _ = reply.send(self.canvas.snapshot());
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> ServerStats {
        #[allow(clippy::cast_precision_loss)]
        let megabytes = self.canvas.approx_bytes() as f64 / (1024.0 * 1024.0);
        ServerStats {
            total_strokes: self.canvas.len(),
            capacity: self.canvas.capacity(),
            memory_usage: format!("{megabytes:.2} MB"),
            connected_clients: self.sessions.len(),
            active_users: self.sessions.active_users(),
        }
    }

    fn connect(
        &mut self,
        connection_id: ConnectionId,
        requested: Option<&str>,
        sender: mpsc::Sender<Frame>,
        now: Instant,
    ) -> Result<SessionAssigned, ConnectError> {
        // A reclaim swaps one live session for another, so it never counts against the limit.
        let reclaims = requested.is_some_and(|r| self.sessions.holds_identity(r));
        let limit = self.tuning.max_connections;
        if !reclaims && self.sessions.len() >= limit {
            warn!(limit, "connection refused; server full");
            return Err(ConnectError::ConnectionLimit { limit });
        }

        let registration = self.sessions.register(connection_id, sender, requested, now);
        if let Some(displaced) = registration.displaced {
            info!(identity = %registration.identity, "identity claimed by new connection; dropping older session");
            let deliveries = self.retire(displaced);
            self.deliver(connection_id, deliveries);
        }

        let assigned = SessionAssigned {
            identity: registration.identity,
            display_name: registration.display_name,
        };
        let hello = Frame::request(protocol::SESSION_ASSIGNED, Data::new())
            .with_data("identity", assigned.identity.as_str())
            .with_data("display_name", assigned.display_name.as_str());
        let viewport = self.sessions.get(connection_id).and_then(Session::last_viewport);
        let state = Frame::request(protocol::CANVAS_STATE, self.canvas_state(&self.canvas.query(viewport.as_ref())));
        self.deliver(connection_id, vec![Delivery::Reply(hello), Delivery::Reply(state)]);

        info!(
            identity = %assigned.identity,
            name = %assigned.display_name,
            clients = self.sessions.len(),
            "session connected"
        );
        Ok(assigned)
    }

    fn disconnect(&mut self, connection_id: ConnectionId) {
        let Some(session) = self.sessions.unregister(connection_id) else {
            return;
        };
        info!(identity = %session.identity(), clients = self.sessions.len(), "session disconnected");
        let deliveries = self.retire(session);
        self.deliver(connection_id, deliveries);
    }

    fn sweep_sessions(&mut self, now: Instant) {
        for eviction in self.sessions.sweep_zombies(now) {
            let connection_id = eviction.session.connection_id();
            info!(
                identity = %eviction.session.identity(),
                reason = eviction.reason.as_str(),
                "evicting zombie session"
            );
            let deliveries = self.retire(eviction.session);
            self.deliver(connection_id, deliveries);
        }
    }

    /// Final bookkeeping for a session that was already unregistered.
    /// Dropping `session` closes its socket.
    fn retire(&mut self, session: Session) -> Vec<Delivery> {
        let connection_id = session.connection_id();
        let mut deliveries = Vec::with_capacity(2);
        if let Some(batch) = self.batcher.take(connection_id) {
            deliveries.push(Delivery::Peers(segments_frame(batch)));
        }
        self.limiter.forget(connection_id);
        deliveries.push(Delivery::Peers(
            Frame::request(protocol::USER_LEFT, Data::new())
                .with_data("identity", session.identity())
                .with_from(session.identity()),
        ));
        deliveries
    }

    /// Ask the snapshot task to save right away.
    pub(crate) fn persist_now(&self) {
        let Some(tx) = &self.persist_tx else {
            return;
        };
        match tx.try_send(self.canvas.snapshot()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("snapshot queue full; immediate save skipped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("snapshot queue closed; immediate save skipped");
            }
        }
    }

    pub(crate) fn canvas_state(&self, strokes: &[&Stroke]) -> Data {
        Data::from([
            ("strokes".into(), serde_json::to_value(strokes).unwrap_or_default()),
            ("total_strokes".into(), self.canvas.len().into()),
            ("capacity".into(), self.canvas.capacity().into()),
        ])
    }

    /// Fan out handler output relative to `origin`.
    pub(crate) fn deliver(&self, origin: ConnectionId, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            match delivery {
                Delivery::Reply(frame) => {
                    if let Some(session) = self.sessions.get(origin) {
                        push(session, frame);
                    }
                }
                Delivery::Peers(frame) => {
                    for session in self.sessions.peers(Some(origin)) {
                        push(session, frame.clone());
                    }
                }
                Delivery::Everyone(frame) => {
                    for session in self.sessions.peers(None) {
                        push(session, frame.clone());
                    }
                }
            }
        }
    }
}

fn push(session: &Session, frame: Frame) {
    match session.sender().try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(frame)) => {
            warn!(identity = %session.identity(), syscall = %frame.syscall, "outbound queue full; dropping frame");
        }
        Err(mpsc::error::TrySendError::Closed(frame)) => {
            debug!(identity = %session.identity(), syscall = %frame.syscall, "outbound queue closed; dropping frame");
        }
    }
}

pub(crate) fn segments_frame(batch: SegmentBatch) -> Frame {
    let data = Data::from([
        ("identity".into(), batch.identity.clone().into()),
        ("segments".into(), serde_json::to_value(&batch.segments).unwrap_or_default()),
        ("timestamp".into(), now_ms().into()),
    ]);
    Frame::request(protocol::STROKE_SEGMENTS, data).with_from(batch.identity)
}

// =============================================================================
// TASKS
// =============================================================================

/// Run the hub on its own task.
pub fn spawn(mut hub: Hub) -> (HubHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<HubCommand>(HUB_QUEUE_CAPACITY);
    let task = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            hub.handle(cmd, Instant::now());
        }
        debug!("canvas hub stopped");
    });
    (HubHandle { tx }, task)
}

/// Start the periodic maintenance timers. Each stops once the hub is gone.
#[must_use]
pub fn spawn_timers(handle: &HubHandle, tuning: &HubTuning) -> Vec<JoinHandle<()>> {
    info!(
        sweep_secs = tuning.sweep_interval.as_secs(),
        rate_limit_sweep_secs = tuning.rate_limit_sweep_interval.as_secs(),
        batch_timeout_ms = u64::try_from(tuning.batch_timeout.as_millis()).unwrap_or(u64::MAX),
        "hub timers configured"
    );
    let flush_every = (tuning.batch_timeout / 2).max(Duration::from_millis(1));
    vec![
        spawn_ticker(handle.clone(), tuning.sweep_interval, || HubCommand::SweepSessions),
        spawn_ticker(handle.clone(), tuning.rate_limit_sweep_interval, || HubCommand::SweepRateLimits),
        spawn_ticker(handle.clone(), flush_every, || HubCommand::FlushBatches),
    ]
}

fn spawn_ticker(handle: HubHandle, period: Duration, make: fn() -> HubCommand) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !handle.send(make()).await {
                break;
            }
        }
    })
}

// =============================================================================
// TEST SUPPORT
// =============================================================================


#[cfg(test)]
#[path = "hub_test.rs"]
mod tests;
