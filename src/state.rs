//! Canvas data model and shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! carries no canvas data itself: the hub task owns the stroke log, sessions
//! and throttles, and handlers talk to it through `HubHandle`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::services::hub::HubHandle;

/// Per-socket identifier, generated on upgrade. Never shown to clients.
pub type ConnectionId = Uuid;

/// Brush name that turns a finished stroke into an erase gesture.
pub const ERASER_BRUSH: &str = "eraser";

// =============================================================================
// GEOMETRY
// =============================================================================

/// World-space coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn distance(self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Axis-aligned world rectangle, inclusive on all edges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Rect {
    #[must_use]
    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }
}

/// A client's visible world rectangle plus zoom factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub scale: f64,
}

impl Viewport {
    /// Visible rectangle grown by `padding / scale` on every side.
    #[must_use]
    pub fn padded(&self, padding: f64) -> Rect {
        let pad = padding / self.scale;
        Rect {
            min_x: self.x - pad,
            min_y: self.y - pad,
            max_x: self.x + self.width + pad,
            max_y: self.y + self.height + pad,
        }
    }
}

// =============================================================================
// STROKES
// =============================================================================

/// A finished freehand gesture. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub id: String,
    pub points: Vec<Point>,
    pub color: String,
    pub size: f64,
    pub brush: String,
    /// Milliseconds since Unix epoch.
    pub timestamp: i64,
    /// Identity of the session that drew it.
    #[serde(default)]
    pub owner: String,
}

impl Stroke {
    /// The point the chunk index keys this stroke by.
    #[must_use]
    pub fn last_point(&self) -> Option<Point> {
        self.points.last().copied()
    }

    #[must_use]
    pub fn is_eraser(&self) -> bool {
        self.brush == ERASER_BRUSH
    }
}

/// One incremental piece of an in-progress stroke. Relayed, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokeSegment {
    pub from: Point,
    pub to: Point,
    pub color: String,
    pub size: f64,
    pub brush: String,
    #[serde(default)]
    pub owner: String,
}

/// Cursor position as relayed to peers (`cursor:moved`, `user:joined`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorData {
    pub identity: String,
    pub name: String,
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brush: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
}

/// Server counters reported by `stats:get` and `GET /api/stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStats {
    pub total_strokes: usize,
    pub capacity: usize,
    pub memory_usage: String,
    pub connected_clients: usize,
    pub active_users: usize,
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub config: Arc<Config>,
}

impl AppState {
    #[must_use]
    pub fn new(hub: HubHandle, config: Config) -> Self {
        Self { hub, config: Arc::new(config) }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
