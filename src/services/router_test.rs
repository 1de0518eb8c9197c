use std::time::Duration;

use serde_json::json;

use super::*;
use crate::frame::Status;
use crate::services::hub::test_support::{connect, hub, send};
use crate::state::test_helpers::stroke_at;

fn stroke_json(x: f64, y: f64) -> serde_json::Value {
    json!({
        "points": [{"x": x, "y": y}, {"x": x + 5.0, "y": y + 5.0}],
        "color": "#112233",
        "size": 4.0,
        "brush": "round"
    })
}

fn segment_json(i: f64) -> serde_json::Value {
    json!({
        "from": {"x": i, "y": 0.0},
        "to": {"x": i + 1.0, "y": 0.0},
        "color": "#000",
        "size": 2.0,
        "brush": "round"
    })
}

fn viewport_json(x: f64, y: f64) -> serde_json::Value {
    json!({"x": x, "y": y, "width": 800.0, "height": 600.0, "scale": 1.0})
}

#[test]
fn draw_reaches_peers_but_not_sender() {
    let mut hub = hub();
    let now = Instant::now();
    let mut alice = connect(&mut hub, now);
    let mut bob = connect(&mut hub, now);

    send(&mut hub, &alice, protocol::STROKE_DRAW, stroke_json(10.0, 10.0), now);

    assert!(alice.drain().is_empty(), "no self-echo");
    let frames = bob.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].syscall, protocol::STROKE_ADDED);
    assert_eq!(frames[0].from.as_deref(), Some(alice.identity.as_str()));
    assert_eq!(frames[0].data["owner"], alice.identity.as_str());
    assert_eq!(hub.canvas.len(), 1);
}

#[test]
fn draws_inside_interval_are_dropped() {
    let mut hub = hub();
    let now = Instant::now();
    let alice = connect(&mut hub, now);
    let mut bob = connect(&mut hub, now);

    send(&mut hub, &alice, protocol::STROKE_DRAW, stroke_json(0.0, 0.0), now);
    send(&mut hub, &alice, protocol::STROKE_DRAW, stroke_json(0.0, 0.0), now + Duration::from_millis(10));
    send(&mut hub, &alice, protocol::STROKE_DRAW, stroke_json(0.0, 0.0), now + Duration::from_millis(60));

    assert_eq!(bob.syscalls(), vec![protocol::STROKE_ADDED, protocol::STROKE_ADDED]);
    assert_eq!(hub.canvas.len(), 2);
}

#[test]
fn clear_respects_cooldown_and_reaches_everyone() {
    let mut hub = hub();
    let now = Instant::now();
    let mut alice = connect(&mut hub, now);
    let mut bob = connect(&mut hub, now);
    send(&mut hub, &alice, protocol::STROKE_DRAW, stroke_json(0.0, 0.0), now);
    bob.drain();

    send(&mut hub, &alice, protocol::CANVAS_CLEAR, json!({}), now);
    assert_eq!(alice.syscalls(), vec![protocol::CANVAS_CLEARED]);
    assert_eq!(bob.syscalls(), vec![protocol::CANVAS_CLEARED]);
    assert!(hub.canvas.is_empty());

    send(&mut hub, &alice, protocol::CANVAS_CLEAR, json!({}), now + Duration::from_secs(2));
    assert!(alice.drain().is_empty());
    assert!(bob.drain().is_empty());

    // Cooldown is per session.
    send(&mut hub, &bob, protocol::CANVAS_CLEAR, json!({}), now + Duration::from_secs(2));
    assert_eq!(alice.syscalls(), vec![protocol::CANVAS_CLEARED]);

    send(&mut hub, &alice, protocol::CANVAS_CLEAR, json!({}), now + Duration::from_secs(5));
    assert_eq!(bob.syscalls(), vec![protocol::CANVAS_CLEARED, protocol::CANVAS_CLEARED]);
}

#[test]
fn eraser_removes_strokes_and_tells_everyone() {
    let mut hub = hub();
    let now = Instant::now();
    let mut alice = connect(&mut hub, now);
    let mut bob = connect(&mut hub, now);
    hub.canvas.append(stroke_at("keep", &[(500.0, 500.0)]));
    hub.canvas.append(stroke_at("gone", &[(10.0, 10.0)]));

    let eraser = json!({
        "points": [{"x": 12.0, "y": 10.0}],
        "color": "#fff",
        "size": 10.0,
        "brush": "eraser"
    });
    send(&mut hub, &alice, protocol::STROKE_DRAW, eraser.clone(), now);

    let frames = alice.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].syscall, protocol::STROKES_REMOVED);
    assert_eq!(frames[0].data["removed_indices"], json!([1]));
    assert_eq!(bob.syscalls(), vec![protocol::STROKES_REMOVED]);
    assert_eq!(hub.canvas.len(), 1, "eraser strokes are never stored");

    // Nothing left to hit: silent.
    send(&mut hub, &alice, protocol::STROKE_DRAW, eraser, now + Duration::from_millis(100));
    assert!(alice.drain().is_empty());
    assert!(bob.drain().is_empty());
}

#[test]
fn segments_are_batched_per_sender() {
    let mut hub = hub();
    let now = Instant::now();
    let mut alice = connect(&mut hub, now);
    let mut bob = connect(&mut hub, now);

    for i in 0..10_u32 {
        let at = now + Duration::from_millis(u64::from(i) * 20);
        send(&mut hub, &alice, protocol::STROKE_SEGMENT, segment_json(f64::from(i)), at);
        if i < 9 {
            assert!(bob.drain().is_empty(), "batch not full after {} segments", i + 1);
        }
    }

    let frames = bob.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].syscall, protocol::STROKE_SEGMENTS);
    assert_eq!(frames[0].data["identity"], alice.identity.as_str());
    let segments = frames[0].data["segments"].as_array().expect("segments");
    assert_eq!(segments.len(), 10);
    assert_eq!(segments[0]["from"]["x"], 0.0);
    assert_eq!(segments[9]["owner"], alice.identity.as_str());
    assert!(alice.drain().is_empty());
}

#[test]
fn first_viewport_cursor_announces_once() {
    let mut hub = hub();
    let now = Instant::now();
    let alice = connect(&mut hub, now);
    let mut bob = connect(&mut hub, now);

    send(&mut hub, &alice, protocol::CURSOR_MOVE, json!({"x": 1.0, "y": 2.0}), now);
    assert_eq!(bob.syscalls(), vec![protocol::CURSOR_MOVED]);

    let later = now + Duration::from_millis(150);
    send(&mut hub, &alice, protocol::CURSOR_MOVE, json!({"x": 1.0, "y": 2.0, "viewport": viewport_json(0.0, 0.0)}), later);
    let frames = bob.drain();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].syscall, protocol::USER_JOINED);
    assert_eq!(frames[0].data["identity"], alice.identity.as_str());
    assert!(frames[0].data["name"].as_str().is_some_and(|n| !n.is_empty()));
    assert_eq!(frames[1].syscall, protocol::CURSOR_MOVED);

    let much_later = now + Duration::from_millis(300);
    send(&mut hub, &alice, protocol::CURSOR_MOVE, json!({"x": 3.0, "y": 4.0, "viewport": viewport_json(0.0, 0.0)}), much_later);
    assert_eq!(bob.syscalls(), vec![protocol::CURSOR_MOVED]);
    assert_eq!(hub.sessions.active_users(), 1);
}

#[test]
fn state_request_is_filtered_by_last_viewport() {
    let mut hub = hub();
    let now = Instant::now();
    let mut alice = connect(&mut hub, now);
    hub.canvas.append(stroke_at("near", &[(100.0, 100.0)]));
    hub.canvas.append(stroke_at("far", &[(50_000.0, 50_000.0)]));

    let request = send(&mut hub, &alice, protocol::CANVAS_STATE, json!({}), now);
    let reply = alice.drain().pop().expect("reply");
    assert_eq!(reply.parent_id, Some(request.id));
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.data["strokes"].as_array().map(Vec::len), Some(2));

    send(&mut hub, &alice, protocol::CURSOR_MOVE, json!({"x": 1.0, "y": 1.0, "viewport": viewport_json(0.0, 0.0)}), now);
    alice.drain();
    send(&mut hub, &alice, protocol::CANVAS_STATE, json!({}), now + Duration::from_millis(300));
    let reply = alice.drain().pop().expect("reply");
    let strokes = reply.data["strokes"].as_array().expect("strokes");
    assert_eq!(strokes.len(), 1);
    assert_eq!(strokes[0]["id"], "near");
    assert_eq!(reply.data["total_strokes"], 2);
    assert_eq!(reply.data["capacity"], 2000);
}

#[test]
fn history_returns_everything_to_requester_only() {
    let mut hub = hub();
    let now = Instant::now();
    let mut alice = connect(&mut hub, now);
    let mut bob = connect(&mut hub, now);
    hub.canvas.append(stroke_at("a", &[(1.0, 1.0)]));
    hub.canvas.append(stroke_at("b", &[(90_000.0, 1.0)]));

    send(&mut hub, &alice, protocol::CANVAS_HISTORY, json!({}), now);
    let frames = alice.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].syscall, protocol::CANVAS_HISTORY);
    assert_eq!(frames[0].data["strokes"][1]["id"], "b");
    assert!(bob.drain().is_empty());
}

#[test]
fn progressive_replies_in_chunks_then_done() {
    let mut hub = hub();
    let now = Instant::now();
    let mut alice = connect(&mut hub, now);
    for i in 0..250_i32 {
        hub.canvas.append(stroke_at(&format!("s{i}"), &[(f64::from(i), 0.0)]));
    }

    let request = send(&mut hub, &alice, protocol::CANVAS_PROGRESSIVE, json!({}), now);
    let frames = alice.drain();
    assert_eq!(frames.len(), 4);
    for (i, frame) in frames[..3].iter().enumerate() {
        assert_eq!(frame.status, Status::Item);
        assert_eq!(frame.parent_id, Some(request.id));
        assert_eq!(frame.data["chunk_index"], i);
        assert_eq!(frame.data["total_chunks"], 3);
        assert!(frame.data["viewport"].is_null());
    }
    assert_eq!(frames[2].data["strokes"].as_array().map(Vec::len), Some(50));
    assert_eq!(frames[3].status, Status::Done);
    assert_eq!(frames[3].data["total_chunks"], 3);
}

#[test]
fn progressive_uses_given_viewport() {
    let mut hub = hub();
    let now = Instant::now();
    let mut alice = connect(&mut hub, now);
    hub.canvas.append(stroke_at("near", &[(100.0, 100.0)]));
    hub.canvas.append(stroke_at("far", &[(50_000.0, 50_000.0)]));

    send(&mut hub, &alice, protocol::CANVAS_PROGRESSIVE, json!({"viewport": viewport_json(0.0, 0.0)}), now);
    let frames = alice.drain();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].data["strokes"][0]["id"], "near");
    assert_eq!(frames[0].data["viewport"]["width"], 800.0);
}

#[test]
fn rename_reaches_everyone_and_sticks() {
    let mut hub = hub();
    let now = Instant::now();
    let mut alice = connect(&mut hub, now);
    let mut bob = connect(&mut hub, now);

    send(&mut hub, &alice, protocol::USER_RENAME, json!({"name": " Ada "}), now);
    let frames = alice.drain();
    assert_eq!(frames[0].syscall, protocol::USER_RENAMED);
    assert_eq!(frames[0].data["name"], "Ada");
    assert_eq!(bob.syscalls(), vec![protocol::USER_RENAMED]);

    send(&mut hub, &alice, protocol::CURSOR_MOVE, json!({"x": 0.0, "y": 0.0}), now);
    assert_eq!(bob.drain()[0].data["name"], "Ada");
}

#[test]
fn ping_replies_and_refreshes_heartbeat_only() {
    let mut hub = hub();
    let now = Instant::now();
    let mut alice = connect(&mut hub, now);

    let request = send(&mut hub, &alice, protocol::SESSION_PING, json!({}), now + Duration::from_secs(80));
    let reply = alice.drain().pop().expect("pong");
    assert_eq!(reply.syscall, protocol::SESSION_PING);
    assert_eq!(reply.parent_id, Some(request.id));

    // Heartbeat is fresh, but nothing meaningful happened for 125s.
    hub.handle(crate::services::hub::HubCommand::SweepSessions, now + Duration::from_secs(125));
    assert!(hub.sessions.is_empty());
}

#[test]
fn stats_reply() {
    let mut hub = hub();
    let now = Instant::now();
    let mut alice = connect(&mut hub, now);
    hub.canvas.append(stroke_at("a", &[(1.0, 1.0)]));

    send(&mut hub, &alice, protocol::STATS_GET, json!({}), now);
    let reply = alice.drain().pop().expect("stats");
    assert_eq!(reply.data["total_strokes"], 1);
    assert_eq!(reply.data["connected_clients"], 1);
    assert_eq!(reply.data["active_users"], 0);
    assert!(reply.data["memory_usage"].as_str().is_some_and(|m| m.ends_with(" MB")));
}

#[test]
fn widest_allowed_viewport_still_answers_state_requests() {
    let mut hub = hub();
    let now = Instant::now();
    let mut alice = connect(&mut hub, now);
    send(&mut hub, &alice, protocol::STROKE_DRAW, stroke_json(10.0, 10.0), now);

    let bounds = crate::config::Limits::default().max_coordinate;
    let cursor = json!({
        "x": 0.0,
        "y": 0.0,
        "viewport": {
            "x": -bounds,
            "y": -bounds,
            "width": bounds * 2.0,
            "height": bounds * 2.0,
            "scale": protocol::MIN_VIEWPORT_SCALE
        }
    });
    send(&mut hub, &alice, protocol::CURSOR_MOVE, cursor, now);
    alice.drain();

    let request = send(&mut hub, &alice, protocol::CANVAS_STATE, json!({}), now + Duration::from_millis(300));
    let frames = alice.drain();
    let reply = frames.iter().find(|f| f.parent_id == Some(request.id)).expect("state reply");
    assert_eq!(reply.data["strokes"].as_array().map(Vec::len), Some(1));
}

#[test]
fn progressive_chunk_count_fits_the_outbound_queue() {
    let mut hub = hub();
    hub.tuning.progressive_chunk_size = 1;
    let now = Instant::now();
    let mut alice = connect(&mut hub, now);
    for i in 0..1000_i32 {
        hub.canvas.append(stroke_at(&format!("s{i}"), &[(f64::from(i), 0.0)]));
    }

    send(&mut hub, &alice, protocol::CANVAS_PROGRESSIVE, json!({}), now);
    let frames = alice.drain();
    let (done, items) = frames.split_last().expect("frames");
    assert_eq!(done.status, Status::Done);
    assert_eq!(done.data["total_strokes"], 1000);
    assert_eq!(done.data["total_chunks"], items.len());
    assert!(items.len() <= crate::services::hub::MAX_PROGRESSIVE_CHUNKS);

    let delivered: usize = items.iter().filter_map(|f| f.data["strokes"].as_array()).map(Vec::len).sum();
    assert_eq!(delivered, 1000);
}
