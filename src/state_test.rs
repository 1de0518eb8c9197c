use super::*;

#[test]
fn padded_rect_scales_padding_by_zoom() {
    let vp = Viewport { x: 0.0, y: 0.0, width: 100.0, height: 50.0, scale: 2.0 };
    let rect = vp.padded(200.0);
    assert!((rect.min_x + 100.0).abs() < f64::EPSILON);
    assert!((rect.min_y + 100.0).abs() < f64::EPSILON);
    assert!((rect.max_x - 200.0).abs() < f64::EPSILON);
    assert!((rect.max_y - 150.0).abs() < f64::EPSILON);
}

#[test]
fn rect_contains_is_inclusive() {
    let rect = Rect { min_x: 0.0, min_y: 0.0, max_x: 10.0, max_y: 10.0 };
    assert!(rect.contains(Point::new(0.0, 10.0)));
    assert!(rect.contains(Point::new(5.0, 5.0)));
    assert!(!rect.contains(Point::new(10.5, 5.0)));
}

#[test]
fn stroke_without_owner_deserializes() {
    let json = serde_json::json!({
        "id": "stroke_1",
        "points": [{"x": 1.0, "y": 2.0}, {"x": 3.0, "y": 4.0}],
        "color": "#000",
        "size": 2.0,
        "brush": "round",
        "timestamp": 5
    });
    let stroke: Stroke = serde_json::from_value(json).unwrap();
    assert!(stroke.owner.is_empty());
    assert_eq!(stroke.last_point(), Some(Point::new(3.0, 4.0)));
    assert!(!stroke.is_eraser());
}

#[test]
fn cursor_data_skips_absent_fields() {
    let cursor = CursorData {
        identity: "user_1".into(),
        name: "Peyo".into(),
        x: 1.0,
        y: 2.0,
        size: None,
        color: None,
        brush: None,
        viewport: None,
    };
    let value = serde_json::to_value(&cursor).unwrap();
    assert!(value.get("viewport").is_none());
    assert_eq!(value["name"], "Peyo");
}

#[test]
fn point_distance() {
    assert!((Point::new(0.0, 0.0).distance(Point::new(3.0, 4.0)) - 5.0).abs() < 1e-9);
}
