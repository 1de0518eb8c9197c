//! Spatial chunk index: fixed-size grid buckets for viewport queries.
//!
//! DESIGN
//! ======
//! World space is cut into `CHUNK_SIZE` square cells. Each stroke is filed
//! under the cell of its *last* point only, by insertion sequence number.
//! A long stroke that crosses several cells is therefore only found through
//! the cell it ends in; viewport queries near its start can miss it. This is
//! a known approximation and is kept on purpose.
//!
//! The index never deletes single entries. Evicted sequence numbers linger
//! until the owning store calls `rebuild`, and callers skip numbers that no
//! longer resolve to a stroke.

use std::collections::{HashMap, HashSet};

use crate::state::{Point, Rect, Stroke};

/// Edge length of one grid cell in world units.
pub const CHUNK_SIZE: f64 = 1000.0;

/// Grid cell coordinates: `floor(x / CHUNK_SIZE), floor(y / CHUNK_SIZE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub cx: i64,
    pub cy: i64,
}

impl ChunkKey {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn for_point(p: Point) -> Self {
        Self { cx: (p.x / CHUNK_SIZE).floor() as i64, cy: (p.y / CHUNK_SIZE).floor() as i64 }
    }
}

#[derive(Debug, Default)]
pub struct ChunkIndex {
    cells: HashMap<ChunkKey, Vec<u64>>,
    entries: usize,
}

impl ChunkIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// File a stroke under the cell of its last point.
    pub fn insert(&mut self, seq: u64, stroke: &Stroke) {
        let Some(last) = stroke.last_point() else {
            return;
        };
        self.cells.entry(ChunkKey::for_point(last)).or_default().push(seq);
        self.entries += 1;
    }

    /// Drop everything and re-file the given `(seq, stroke)` pairs.
    pub fn rebuild<'a>(&mut self, strokes: impl IntoIterator<Item = (u64, &'a Stroke)>) {
        self.clear();
        for (seq, stroke) in strokes {
            self.insert(seq, stroke);
        }
    }

    pub fn clear(&mut self) {
        self.cells.clear();
        self.entries = 0;
    }

    /// Occupied cells overlapping `rect`.
    ///
    /// Only cells that hold at least one entry are returned, so a very large
    /// rectangle costs at most one pass over the occupied cells.
    #[must_use]
    pub fn cells_for(&self, rect: &Rect) -> HashSet<ChunkKey> {
        let lo = ChunkKey::for_point(Point::new(rect.min_x, rect.min_y));
        let hi = ChunkKey::for_point(Point::new(rect.max_x, rect.max_y));
        if lo.cx > hi.cx || lo.cy > hi.cy {
            return HashSet::new();
        }

        let span_x = u128::from(hi.cx.abs_diff(lo.cx)) + 1;
        let span_y = u128::from(hi.cy.abs_diff(lo.cy)) + 1;
        let in_range = |k: &ChunkKey| k.cx >= lo.cx && k.cx <= hi.cx && k.cy >= lo.cy && k.cy <= hi.cy;

        let scan_occupied = span_x.checked_mul(span_y).is_none_or(|span| span > self.cells.len() as u128);
        if scan_occupied {
            return self.cells.keys().filter(|k| in_range(k)).copied().collect();
        }

        let mut keys = HashSet::new();
        for cx in lo.cx..=hi.cx {
            for cy in lo.cy..=hi.cy {
                let key = ChunkKey { cx, cy };
                if self.cells.contains_key(&key) {
                    keys.insert(key);
                }
            }
        }
        keys
    }

    /// Sequence numbers filed under `keys`, ascending.
    #[must_use]
    pub fn lookup(&self, keys: &HashSet<ChunkKey>) -> Vec<u64> {
        let mut seqs: Vec<u64> = keys
            .iter()
            .filter_map(|k| self.cells.get(k))
            .flatten()
            .copied()
            .collect();
        seqs.sort_unstable();
        seqs
    }

    /// Entries currently filed, stale ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Occupied cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

#[cfg(test)]
#[path = "chunk_index_test.rs"]
mod tests;
