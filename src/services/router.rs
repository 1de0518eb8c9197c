//! Event router: what the hub does with each client request.
//!
//! Every handler runs inside a hub turn. It mutates state first and returns
//! the frames to fan out as `Delivery` values; the hub sends them afterwards.
//! Throttled or rejected events return nothing and are logged at debug.

use std::time::Instant;

use tracing::{debug, info};

use crate::frame::{Data, Frame, to_data};
use crate::protocol::{self, ClientEvent, CursorDraft, Inbound, StrokeDraft};
use crate::services::batcher::progressive_chunks;
use crate::services::hub::{Delivery, Hub, MAX_PROGRESSIVE_CHUNKS, segments_frame};
use crate::state::{ConnectionId, CursorData, Stroke, StrokeSegment, Viewport};

impl Hub {
    pub(crate) fn on_event(&mut self, connection_id: ConnectionId, inbound: Inbound, now: Instant) -> Vec<Delivery> {
        let Inbound { frame: request, event } = inbound;
        let Some(session) = self.sessions.get(connection_id) else {
            debug!(%connection_id, syscall = %request.syscall, "event for unknown connection");
            return Vec::new();
        };
        let identity = session.identity().to_string();

        // Heartbeat only; pings never count as activity.
        if matches!(event, ClientEvent::Ping) {
            self.sessions.touch_heartbeat(connection_id, now);
            return vec![Delivery::Reply(request.done())];
        }

        if let Some(kind) = event.rate_kind() {
            if let Err(e) = self.limiter.check(connection_id, kind, now) {
                debug!(%identity, error = %e, "event throttled");
                return Vec::new();
            }
        }
        self.sessions.touch_activity(connection_id, now);

        match event {
            ClientEvent::Draw(draft) => self.on_draw(&identity, draft),
            ClientEvent::Segment(segment) => self.on_segment(connection_id, &identity, segment, now),
            ClientEvent::CursorMove(cursor) => self.on_cursor(connection_id, identity, cursor),
            ClientEvent::ClearCanvas => self.on_clear(connection_id, &identity, now),
            ClientEvent::RequestState => {
                let viewport = self.sessions.get(connection_id).and_then(|s| s.last_viewport());
                let data = self.canvas_state(&self.canvas.query(viewport.as_ref()));
                vec![Delivery::Reply(request.done_with(data))]
            }
            ClientEvent::RequestHistory => {
                let strokes = serde_json::to_value(self.canvas.all()).unwrap_or_default();
                vec![Delivery::Reply(request.done_with(Data::from([("strokes".into(), strokes)])))]
            }
            ClientEvent::RequestProgressive(viewport) => self.on_progressive(connection_id, &request, viewport),
            ClientEvent::Rename(name) => self.on_rename(connection_id, identity, name),
            ClientEvent::GetStats => vec![Delivery::Reply(request.done_with(to_data(&self.stats())))],
            ClientEvent::Ping => Vec::new(),
        }
    }

    fn on_draw(&mut self, identity: &str, draft: StrokeDraft) -> Vec<Delivery> {
        let stroke = draft.into_stroke(identity);
        if stroke.is_eraser() {
            return self.on_erase(identity, &stroke);
        }

        let frame = Frame::request(protocol::STROKE_ADDED, to_data(&stroke)).with_from(identity);
        let points = stroke.points.len();
        let evicted = self.canvas.append(stroke);
        if evicted > 0 {
            debug!(evicted, capacity = self.canvas.capacity(), "oldest strokes evicted");
        }
        debug!(%identity, points, total = self.canvas.len(), "stroke added");
        vec![Delivery::Peers(frame)]
    }

    fn on_erase(&mut self, identity: &str, eraser: &Stroke) -> Vec<Delivery> {
        let removed = self.canvas.erase(&eraser.points, eraser.size / 2.0);
        if removed.is_empty() {
            return Vec::new();
        }
        info!(%identity, removed = removed.len(), total = self.canvas.len(), "strokes erased");
        let frame = Frame::request(protocol::STROKES_REMOVED, Data::from([("removed_indices".into(), removed.into())]))
            .with_from(identity);
        vec![Delivery::Everyone(frame)]
    }

    fn on_segment(
        &mut self,
        connection_id: ConnectionId,
        identity: &str,
        mut segment: StrokeSegment,
        now: Instant,
    ) -> Vec<Delivery> {
        segment.owner = identity.to_string();
        match self.batcher.push(connection_id, identity, segment, now) {
            Some(batch) => vec![Delivery::Peers(segments_frame(batch))],
            None => Vec::new(),
        }
    }

    fn on_cursor(&mut self, connection_id: ConnectionId, identity: String, cursor: CursorDraft) -> Vec<Delivery> {
        let name = self
            .sessions
            .get(connection_id)
            .map(|s| s.name().to_string())
            .unwrap_or_default();
        let data = to_data(&CursorData {
            identity: identity.clone(),
            name,
            x: cursor.x,
            y: cursor.y,
            size: cursor.size,
            color: cursor.color,
            brush: cursor.brush,
            viewport: cursor.viewport,
        });

        let mut deliveries = Vec::with_capacity(2);
        if let Some(viewport) = cursor.viewport {
            if self.sessions.mark_announced(connection_id) {
                info!(%identity, "user joined");
                deliveries.push(Delivery::Peers(
                    Frame::request(protocol::USER_JOINED, data.clone()).with_from(identity.as_str()),
                ));
            }
            self.sessions.set_viewport(connection_id, viewport);
        }
        deliveries.push(Delivery::Peers(Frame::request(protocol::CURSOR_MOVED, data).with_from(identity)));
        deliveries
    }

    fn on_clear(&mut self, connection_id: ConnectionId, identity: &str, now: Instant) -> Vec<Delivery> {
        if !self.sessions.try_clear(connection_id, self.tuning.clear_cooldown, now) {
            debug!(%identity, "clear ignored during cooldown");
            return Vec::new();
        }
        let cleared = self.canvas.len();
        self.canvas.clear();
        self.persist_now();
        info!(%identity, cleared, "canvas cleared");
        vec![Delivery::Everyone(Frame::request(protocol::CANVAS_CLEARED, Data::new()).with_from(identity))]
    }

    fn on_progressive(
        &self,
        connection_id: ConnectionId,
        request: &Frame,
        viewport: Option<Viewport>,
    ) -> Vec<Delivery> {
        let viewport = viewport.or_else(|| self.sessions.get(connection_id).and_then(|s| s.last_viewport()));
        let strokes = self.canvas.query(viewport.as_ref());
        let viewport_value = serde_json::to_value(viewport).unwrap_or_default();

        let chunk_size = self
            .tuning
            .progressive_chunk_size
            .max(strokes.len().div_ceil(MAX_PROGRESSIVE_CHUNKS));

        let mut deliveries = Vec::new();
        let mut total_chunks = 0;
        for (chunk_index, total, chunk) in progressive_chunks(&strokes, chunk_size) {
            total_chunks = total;
            let data = Data::from([
                ("strokes".into(), serde_json::to_value(chunk).unwrap_or_default()),
                ("chunk_index".into(), chunk_index.into()),
                ("total_chunks".into(), total.into()),
                ("viewport".into(), viewport_value.clone()),
            ]);
            deliveries.push(Delivery::Reply(request.item(data)));
        }
        let done = Data::from([
            ("total_chunks".into(), total_chunks.into()),
            ("total_strokes".into(), strokes.len().into()),
        ]);
        deliveries.push(Delivery::Reply(request.done_with(done)));
        deliveries
    }

    fn on_rename(&mut self, connection_id: ConnectionId, identity: String, name: String) -> Vec<Delivery> {
        self.sessions.set_display_name(connection_id, name.clone());
        info!(%identity, %name, "display name changed");
        let data = Data::from([("identity".into(), identity.clone().into()), ("name".into(), name.into())]);
        vec![Delivery::Everyone(Frame::request(protocol::USER_RENAMED, data).with_from(identity))]
    }
}

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;
