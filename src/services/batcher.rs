//! Segment batching and progressive chunking.
//!
//! Live drawing produces a flood of tiny `stroke:segment` events. Instead of
//! relaying each one, the hub buffers them per connection and fans out a
//! batch once it holds `batch_size` segments or its oldest segment has waited
//! `batch_timeout`. Order inside a batch is arrival order.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::state::{ConnectionId, StrokeSegment};

/// Segments ready to relay to peers.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentBatch {
    pub connection_id: ConnectionId,
    pub identity: String,
    pub segments: Vec<StrokeSegment>,
}

#[derive(Debug)]
struct Pending {
    identity: String,
    segments: Vec<StrokeSegment>,
    first_at: Instant,
}

#[derive(Debug)]
pub struct SegmentBatcher {
    pending: HashMap<ConnectionId, Pending>,
    max_size: usize,
    max_age: Duration,
}

impl SegmentBatcher {
    #[must_use]
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self { pending: HashMap::new(), max_size: max_size.max(1), max_age }
    }

    /// Buffer a segment. Returns the batch when it just became full.
    pub fn push(
        &mut self,
        connection_id: ConnectionId,
        identity: &str,
        segment: StrokeSegment,
        now: Instant,
    ) -> Option<SegmentBatch> {
        let pending = self.pending.entry(connection_id).or_insert_with(|| Pending {
            identity: identity.to_string(),
            segments: Vec::with_capacity(self.max_size),
            first_at: now,
        });
        pending.segments.push(segment);
        if pending.segments.len() >= self.max_size {
            return self.take(connection_id);
        }
        None
    }

    /// Remove and return every batch whose oldest segment is at least `max_age` old.
    pub fn due(&mut self, now: Instant) -> Vec<SegmentBatch> {
        let ready: Vec<ConnectionId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.first_at) >= self.max_age)
            .map(|(id, _)| *id)
            .collect();
        ready.into_iter().filter_map(|id| self.take(id)).collect()
    }

    /// Remove and return whatever is buffered for a connection.
    pub fn take(&mut self, connection_id: ConnectionId) -> Option<SegmentBatch> {
        let pending = self.pending.remove(&connection_id)?;
        if pending.segments.is_empty() {
            return None;
        }
        Some(SegmentBatch { connection_id, identity: pending.identity, segments: pending.segments })
    }

    /// Segments currently buffered across all connections.
    #[cfg(test)]
    pub fn pending_segments(&self) -> usize {
        self.pending.values().map(|p| p.segments.len()).sum()
    }
}

/// Split `items` into fixed-size chunks, yielding `(chunk_index, total_chunks, chunk)`.
pub fn progressive_chunks<T>(items: &[T], chunk_size: usize) -> impl Iterator<Item = (usize, usize, &[T])> {
    let chunk_size = chunk_size.max(1);
    let total = items.len().div_ceil(chunk_size);
    items.chunks(chunk_size).enumerate().map(move |(i, chunk)| (i, total, chunk))
}

#[cfg(test)]
#[path = "batcher_test.rs"]
mod tests;
