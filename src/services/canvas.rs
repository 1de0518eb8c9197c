//! Canvas store: the bounded, ordered log of finished strokes.
//!
//! DESIGN
//! ======
//! Strokes live in a `VecDeque` in acceptance order. Appending past capacity
//! pops the oldest entries from the front. Every stroke gets a sequence
//! number when it is filed; the front of the deque always holds
//! `head_seq`, so `seq - head_seq` is the current position.
//!
//! Eviction does not touch the chunk index. Stale sequence numbers are
//! skipped at query time, and the index is rebuilt once a quarter of the
//! capacity has gone stale. Clears and erases rebuild right away.
//!
//! The store is owned by the hub task. It is never shared across threads.

use std::collections::{HashMap, VecDeque};
use std::mem::size_of;

use tracing::{debug, warn};

use crate::frame::now_ms;
use crate::services::chunk_index::ChunkIndex;
use crate::services::persistence::CanvasSnapshot;
use crate::state::{Point, Stroke, Viewport};

/// World-unit margin added around a viewport, divided by its zoom.
pub const VIEWPORT_PADDING: f64 = 200.0;

/// Most eraser distance checks a single erase may spend.
pub const ERASE_WORK_BUDGET: usize = 2_000_000;

#[derive(Debug)]
pub struct CanvasStore {
    strokes: VecDeque<Stroke>,
    capacity: usize,
    /// Sequence number of `strokes[0]`.
    head_seq: u64,
    index: ChunkIndex,
    /// Evicted entries still filed in the index.
    stale: usize,
}

impl CanvasStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            strokes: VecDeque::with_capacity(capacity),
            capacity,
            head_seq: 0,
            index: ChunkIndex::new(),
            stale: 0,
        }
    }

    /// Append a stroke, evicting from the front if over capacity.
    /// Returns how many strokes were evicted.
    pub fn append(&mut self, stroke: Stroke) -> usize {
        let seq = self.next_seq();
        self.index.insert(seq, &stroke);
        self.strokes.push_back(stroke);

        let mut evicted = 0;
        while self.strokes.len() > self.capacity {
            self.strokes.pop_front();
            self.head_seq += 1;
            evicted += 1;
        }

        self.stale += evicted;
        if self.stale >= self.rebuild_threshold() {
            self.reindex();
        }
        evicted
    }

    /// Remove every stroke. Sequence numbers keep counting upward.
    pub fn clear(&mut self) {
        self.head_seq = self.next_seq();
        self.strokes.clear();
        self.index.clear();
        self.stale = 0;
    }

    /// All strokes, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<&Stroke> {
        self.strokes.iter().collect()
    }

    /// Strokes visible in the padded viewport, in acceptance order.
    ///
    /// Candidates come from the chunk index, then each candidate must have at
    /// least one point inside the padded rectangle. Without a viewport every
    /// stroke is returned.
    #[must_use]
    pub fn query(&self, viewport: Option<&Viewport>) -> Vec<&Stroke> {
        let Some(viewport) = viewport else {
            return self.all();
        };

        if self.index.is_empty() {
            return Vec::new();
        }

        let rect = viewport.padded(VIEWPORT_PADDING);
        let keys = self.index.cells_for(&rect);
        self.index
            .lookup(&keys)
            .into_iter()
            .filter_map(|seq| self.resolve(seq))
            .filter(|stroke| stroke.points.iter().any(|p| rect.contains(*p)))
            .collect()
    }

    /// Remove every non-eraser stroke that comes within `radius` of any of
    /// `points` (measured from the stroke's centerline plus half its width).
    ///
    /// Returns the removed positions as they were before removal, ascending.
    pub fn erase(&mut self, points: &[Point], radius: f64) -> Vec<usize> {
        self.erase_within(points, radius, ERASE_WORK_BUDGET)
    }

    /// `erase` with an explicit cap on distance checks. Once the cap is spent
    /// the remaining strokes are left alone.
    pub(crate) fn erase_within(&mut self, points: &[Point], radius: f64, mut budget: usize) -> Vec<usize> {
        if points.is_empty() {
            return Vec::new();
        }

        let widest = self
            .strokes
            .iter()
            .filter(|s| !s.is_eraser())
            .map(|s| s.size / 2.0)
            .fold(0.0, f64::max);
        let grid = EraserGrid::new(points, radius + widest);

        let mut removed = Vec::new();
        for (i, stroke) in self.strokes.iter().enumerate() {
            if stroke.is_eraser() {
                continue;
            }
            match grid.touches(stroke, radius, &mut budget) {
                Some(true) => removed.push(i),
                Some(false) => {}
                None => {
                    warn!(checked = i, total = self.strokes.len(), "erase work budget spent; remaining strokes kept");
                    break;
                }
            }
        }
        if removed.is_empty() {
            return removed;
        }

        let mut position = 0;
        self.strokes.retain(|_| {
            let keep = removed.binary_search(&position).is_err();
            position += 1;
            keep
        });
        self.reindex();
        removed
    }

    /// Copy of the current contents for persistence.
    #[must_use]
    pub fn snapshot(&self) -> CanvasSnapshot {
        CanvasSnapshot {
            strokes: self.strokes.iter().cloned().collect(),
            total_strokes: self.strokes.len(),
            capacity: self.capacity,
            last_update: now_ms(),
        }
    }

    /// Replace contents with a loaded snapshot. Only the newest `capacity`
    /// strokes are kept. Returns how many were dropped.
    pub fn restore(&mut self, snapshot: CanvasSnapshot) -> usize {
        let mut strokes = snapshot.strokes;
        let dropped = strokes.len().saturating_sub(self.capacity);
        let strokes = strokes.split_off(dropped);

        self.head_seq = self.next_seq();
        self.strokes = strokes.into();
        self.reindex();
        dropped
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strokes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rough heap footprint of the stroke log in bytes.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        self.strokes
            .iter()
            .map(|s| {
                size_of::<Stroke>()
                    + s.points.len() * size_of::<Point>()
                    + s.id.len()
                    + s.color.len()
                    + s.brush.len()
                    + s.owner.len()
            })
            .sum()
    }

    fn next_seq(&self) -> u64 {
        self.head_seq + self.strokes.len() as u64
    }

    fn resolve(&self, seq: u64) -> Option<&Stroke> {
        let offset = usize::try_from(seq.checked_sub(self.head_seq)?).ok()?;
        self.strokes.get(offset)
    }

    fn rebuild_threshold(&self) -> usize {
        (self.capacity / 4).max(1)
    }

    fn reindex(&mut self) {
        let head = self.head_seq;
        self.index
            .rebuild(self.strokes.iter().enumerate().map(|(i, s)| (head + i as u64, s)));
        self.stale = 0;
        debug!(entries = self.index.len(), cells = self.index.cell_count(), "chunk index rebuilt");
    }
}

/// Erase gesture points bucketed into square cells no narrower than the
/// largest hit distance, so a stroke point only consults its 3x3 block.
struct EraserGrid {
    cell: f64,
    buckets: HashMap<(i64, i64), Vec<Point>>,
}

impl EraserGrid {
    fn new(points: &[Point], cell: f64) -> Self {
        let cell = if cell.is_finite() && cell >= 1.0 { cell } else { 1.0 };
        let mut grid = Self { cell, buckets: HashMap::new() };
        for p in points {
            let key = grid.key(*p);
            grid.buckets.entry(key).or_default().push(*p);
        }
        for bucket in grid.buckets.values_mut() {
            bucket.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
            bucket.dedup();
        }
        grid
    }

    #[allow(clippy::cast_possible_truncation)]
    fn key(&self, p: Point) -> (i64, i64) {
        ((p.x / self.cell).floor() as i64, (p.y / self.cell).floor() as i64)
    }

    fn around(&self, (cx, cy): (i64, i64)) -> impl Iterator<Item = &Point> {
        (-1..=1_i64)
            .flat_map(move |dx| (-1..=1_i64).map(move |dy| (cx.saturating_add(dx), cy.saturating_add(dy))))
            .filter_map(|key| self.buckets.get(&key))
            .flatten()
    }

    /// `None` when the budget ran out before an answer was found.
    fn touches(&self, stroke: &Stroke, radius: f64, budget: &mut usize) -> Option<bool> {
        let threshold = radius + stroke.size / 2.0;
        // Consecutive points usually share a cell; skip cells already known to be clear.
        let mut clear_cell = None;
        for p in &stroke.points {
            let key = self.key(*p);
            if clear_cell == Some(key) {
                continue;
            }
            let mut neighbours = 0_usize;
            for e in self.around(key) {
                if *budget == 0 {
                    return None;
                }
                *budget -= 1;
                neighbours += 1;
                if p.distance(*e) <= threshold {
                    return Some(true);
                }
            }
            if neighbours == 0 {
                clear_cell = Some(key);
            }
        }
        Some(false)
    }
}

#[cfg(test)]
#[path = "canvas_test.rs"]
mod tests;
