//! Protocol: syscall names and typed parsing of inbound frames.
//!
//! DESIGN
//! ======
//! Socket tasks turn raw text into an `Inbound` before anything reaches the
//! hub. Parsing checks the envelope, maps the syscall to a `ClientEvent`, and
//! validates the payload against the configured `Limits`. The hub only ever
//! sees well-formed events.
//!
//! A frame that fails here is dropped by the caller. No error frame is sent.

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::config::Limits;
use crate::frame::{Data, Frame, Status, now_ms, tagged_id};
use crate::rate_limit::EventKind;
use crate::state::{Point, Stroke, StrokeSegment, Viewport};

// =============================================================================
// SYSCALLS
// =============================================================================

pub const SESSION_ASSIGNED: &str = "session:assigned";
pub const SESSION_PING: &str = "session:ping";
pub const CANVAS_STATE: &str = "canvas:state";
pub const CANVAS_HISTORY: &str = "canvas:history";
pub const CANVAS_PROGRESSIVE: &str = "canvas:progressive";
pub const CANVAS_CLEAR: &str = "canvas:clear";
pub const CANVAS_CLEARED: &str = "canvas:cleared";
pub const STROKE_DRAW: &str = "stroke:draw";
pub const STROKE_ADDED: &str = "stroke:added";
pub const STROKE_SEGMENT: &str = "stroke:segment";
pub const STROKE_SEGMENTS: &str = "stroke:segments";
pub const STROKES_REMOVED: &str = "strokes:removed";
pub const CURSOR_MOVE: &str = "cursor:move";
pub const CURSOR_MOVED: &str = "cursor:moved";
pub const USER_JOINED: &str = "user:joined";
pub const USER_LEFT: &str = "user:left";
pub const USER_RENAME: &str = "user:rename";
pub const USER_RENAMED: &str = "user:renamed";
pub const STATS_GET: &str = "stats:get";

const MAX_COLOR_LEN: usize = 64;
const MAX_BRUSH_LEN: usize = 32;
const MAX_STROKE_ID_LEN: usize = 128;
const MAX_BRUSH_SIZE: f64 = 1000.0;
const MAX_NAME_CHARS: usize = 50;

/// Smallest zoom factor a viewport may report.
pub const MIN_VIEWPORT_SCALE: f64 = 0.01;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown syscall: {0}")]
    UnknownSyscall(String),
    #[error("inbound frames must have status request")]
    UnexpectedStatus,
    #[error("stroke has no points")]
    EmptyStroke,
    #[error("stroke has {count} points (max {max})")]
    TooManyPoints { count: usize, max: usize },
    #[error("coordinate out of range")]
    CoordinateOutOfRange,
    #[error("invalid {0}")]
    InvalidStyle(&'static str),
    #[error("invalid stroke id")]
    InvalidId,
    #[error("invalid viewport")]
    InvalidViewport,
    #[error("display name must be 1-50 characters")]
    InvalidName,
}

/// A finished stroke as submitted. `id` and `timestamp` are server-filled when absent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StrokeDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub points: Vec<Point>,
    pub color: String,
    pub size: f64,
    pub brush: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl StrokeDraft {
    /// Accept the draft as a stroke owned by `owner`.
    #[must_use]
    pub fn into_stroke(self, owner: &str) -> Stroke {
        Stroke {
            id: self.id.unwrap_or_else(|| tagged_id("stroke")),
            points: self.points,
            color: self.color,
            size: self.size,
            brush: self.brush,
            timestamp: self.timestamp.unwrap_or_else(now_ms),
            owner: owner.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CursorDraft {
    pub x: f64,
    pub y: f64,
    pub size: Option<f64>,
    pub color: Option<String>,
    pub brush: Option<String>,
    pub viewport: Option<Viewport>,
}

#[derive(Debug, Deserialize)]
struct RenameDraft {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ProgressiveDraft {
    #[serde(default)]
    viewport: Option<Viewport>,
}

/// Every request a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Draw(StrokeDraft),
    Segment(StrokeSegment),
    CursorMove(CursorDraft),
    ClearCanvas,
    RequestState,
    RequestHistory,
    RequestProgressive(Option<Viewport>),
    /// Already trimmed.
    Rename(String),
    Ping,
    GetStats,
}

impl ClientEvent {
    /// Throttle bucket, if this event is rate limited.
    #[must_use]
    pub fn rate_kind(&self) -> Option<EventKind> {
        match self {
            Self::Draw(_) => Some(EventKind::Stroke),
            Self::Segment(_) => Some(EventKind::Segment),
            Self::CursorMove(_) => Some(EventKind::Cursor),
            Self::RequestState | Self::RequestHistory | Self::RequestProgressive(_) => Some(EventKind::StateRequest),
            Self::Rename(_) => Some(EventKind::Rename),
            Self::GetStats => Some(EventKind::Stats),
            Self::ClearCanvas | Self::Ping => None,
        }
    }
}

/// A validated inbound request. `frame.data` has been consumed into `event`.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub frame: Frame,
    pub event: ClientEvent,
}

// =============================================================================
// PARSING
// =============================================================================

/// Parse and validate one text message from a client.
///
/// # Errors
///
/// Returns a `ValidationError` when the envelope or payload is unusable.
pub fn parse_inbound(text: &str, limits: &Limits) -> Result<Inbound, ValidationError> {
    let mut frame: Frame = serde_json::from_str(text)?;
    if frame.status != Status::Request {
        return Err(ValidationError::UnexpectedStatus);
    }
    let data = std::mem::take(&mut frame.data);
    let event = parse_event(&frame.syscall, data, limits)?;
    Ok(Inbound { frame, event })
}

/// Map a syscall plus payload to a validated event.
///
/// # Errors
///
/// Returns a `ValidationError` for unknown syscalls or invalid payloads.
pub fn parse_event(syscall: &str, data: Data, limits: &Limits) -> Result<ClientEvent, ValidationError> {
    match syscall {
        STROKE_DRAW => {
            let draft: StrokeDraft = payload(data)?;
            validate_stroke(&draft, limits)?;
            Ok(ClientEvent::Draw(draft))
        }
        STROKE_SEGMENT => {
            let mut segment: StrokeSegment = payload(data)?;
            validate_point(segment.from, limits)?;
            validate_point(segment.to, limits)?;
            validate_style(&segment.color, segment.size, &segment.brush)?;
            segment.owner.clear();
            Ok(ClientEvent::Segment(segment))
        }
        CURSOR_MOVE => {
            let cursor: CursorDraft = payload(data)?;
            validate_point(Point::new(cursor.x, cursor.y), limits)?;
            if let Some(size) = cursor.size {
                validate_size(size)?;
            }
            if let Some(color) = &cursor.color {
                validate_color(color)?;
            }
            if let Some(brush) = &cursor.brush {
                validate_brush(brush)?;
            }
            if let Some(viewport) = &cursor.viewport {
                validate_viewport(viewport, limits)?;
            }
            Ok(ClientEvent::CursorMove(cursor))
        }
        CANVAS_PROGRESSIVE => {
            let draft: ProgressiveDraft = if data.is_empty() { ProgressiveDraft::default() } else { payload(data)? };
            if let Some(viewport) = &draft.viewport {
                validate_viewport(viewport, limits)?;
            }
            Ok(ClientEvent::RequestProgressive(draft.viewport))
        }
        USER_RENAME => {
            let draft: RenameDraft = payload(data)?;
            let name = draft.name.trim();
            let chars = name.chars().count();
            if chars == 0 || chars > MAX_NAME_CHARS || name.chars().any(char::is_control) {
                return Err(ValidationError::InvalidName);
            }
            Ok(ClientEvent::Rename(name.to_string()))
        }
        CANVAS_CLEAR => Ok(ClientEvent::ClearCanvas),
        CANVAS_STATE => Ok(ClientEvent::RequestState),
        CANVAS_HISTORY => Ok(ClientEvent::RequestHistory),
        SESSION_PING => Ok(ClientEvent::Ping),
        STATS_GET => Ok(ClientEvent::GetStats),
        other => Err(ValidationError::UnknownSyscall(other.to_string())),
    }
}

fn payload<T: DeserializeOwned>(data: Data) -> Result<T, ValidationError> {
    let object: serde_json::Map<String, serde_json::Value> = data.into_iter().collect();
    Ok(serde_json::from_value(serde_json::Value::Object(object))?)
}

// =============================================================================
// VALIDATION
// =============================================================================

fn validate_stroke(draft: &StrokeDraft, limits: &Limits) -> Result<(), ValidationError> {
    if draft.points.is_empty() {
        return Err(ValidationError::EmptyStroke);
    }
    if draft.points.len() > limits.max_stroke_points {
        return Err(ValidationError::TooManyPoints { count: draft.points.len(), max: limits.max_stroke_points });
    }
    for point in &draft.points {
        validate_point(*point, limits)?;
    }
    if let Some(id) = &draft.id {
        if id.is_empty() || id.len() > MAX_STROKE_ID_LEN {
            return Err(ValidationError::InvalidId);
        }
    }
    if draft.timestamp.is_some_and(|ts| ts <= 0) {
        return Err(ValidationError::InvalidStyle("timestamp"));
    }
    validate_style(&draft.color, draft.size, &draft.brush)
}

fn validate_point(p: Point, limits: &Limits) -> Result<(), ValidationError> {
    let in_range = |v: f64| v.is_finite() && v.abs() <= limits.max_coordinate;
    if in_range(p.x) && in_range(p.y) {
        Ok(())
    } else {
        Err(ValidationError::CoordinateOutOfRange)
    }
}

fn validate_style(color: &str, size: f64, brush: &str) -> Result<(), ValidationError> {
    validate_color(color)?;
    validate_size(size)?;
    validate_brush(brush)
}

fn validate_color(color: &str) -> Result<(), ValidationError> {
    if color.is_empty() || color.len() > MAX_COLOR_LEN {
        return Err(ValidationError::InvalidStyle("color"));
    }
    Ok(())
}

fn validate_size(size: f64) -> Result<(), ValidationError> {
    if !size.is_finite() || size <= 0.0 || size > MAX_BRUSH_SIZE {
        return Err(ValidationError::InvalidStyle("size"));
    }
    Ok(())
}

fn validate_brush(brush: &str) -> Result<(), ValidationError> {
    if brush.is_empty() || brush.len() > MAX_BRUSH_LEN {
        return Err(ValidationError::InvalidStyle("brush"));
    }
    Ok(())
}

/// Every edge must sit inside the canvas bounds and the zoom must stay at or
/// above `MIN_VIEWPORT_SCALE`, which keeps the padded query rectangle bounded.
fn validate_viewport(v: &Viewport, limits: &Limits) -> Result<(), ValidationError> {
    let finite = [v.x, v.y, v.width, v.height, v.scale].iter().all(|n| n.is_finite());
    if !finite || v.width < 0.0 || v.height < 0.0 || v.scale < MIN_VIEWPORT_SCALE {
        return Err(ValidationError::InvalidViewport);
    }
    let in_bounds = [v.x, v.y, v.x + v.width, v.y + v.height]
        .iter()
        .all(|edge| edge.abs() <= limits.max_coordinate);
    if !in_bounds {
        return Err(ValidationError::InvalidViewport);
    }
    Ok(())
}

#[cfg(test)]
#[path = "protocol_test.rs"]
mod tests;
