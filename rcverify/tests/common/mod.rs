//! In-process stand-in for the verification service.
//!
//! Dataset: piers L1/P1 and L1/P2, column L2/C1. Shear capacity is computed
//! from the stirrups so edits visibly move the DCR; 12 mm stirrups or larger
//! flip the governing combination to the seismic one.
//!
//! Streaming scenarios are picked by session id: `stream-error`,
//! `stream-drop`, `stream-eof`, `stream-slow`; anything else completes.

#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    extract::{Multipart, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

pub const SESSION: &str = "s-1";

#[derive(Default)]
pub struct MockState {
    pub analyze_requests: Mutex<Vec<Value>>,
    pub uploads: Mutex<Vec<(String, usize)>>,
    pub combination_calls: AtomicUsize,
    pub fail_labels: Mutex<HashSet<String>>,
}

impl MockState {
    pub fn fail_for(&self, label: &str) {
        self.fail_labels.lock().unwrap().insert(label.to_string());
    }

    pub fn last_analyze_request(&self) -> Value {
        self.analyze_requests
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no analyze request recorded")
    }

    pub fn analyze_count(&self) -> usize {
        self.analyze_requests.lock().unwrap().len()
    }
}

pub struct MockBackend {
    pub base_url: String,
    pub state: Arc<MockState>,
}

pub async fn spawn() -> MockBackend {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/health", get(health))
        .route("/api/upload", post(upload))
        .route("/api/analyze", post(analyze))
        .route("/api/analyze/stream", post(analyze_stream))
        .route("/api/combinations", get(combinations))
        .route("/api/combination-detail", get(combination_detail))
        .route("/api/report", post(report))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockBackend {
        base_url: format!("http://{}", addr),
        state,
    }
}

/// Address that refuses connections
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

// ========================
// Dataset
// ========================

fn base_elements() -> Vec<(&'static str, &'static str, &'static str, Value)> {
    vec![
        (
            "pier",
            "L1",
            "P1",
            json!({"vertical_bar_diameter_mm": 16, "vertical_bar_spacing_mm": 200,
                   "stirrup_diameter_mm": 10, "stirrup_spacing_mm": 150}),
        ),
        (
            "pier",
            "L1",
            "P2",
            json!({"vertical_bar_diameter_mm": 16, "vertical_bar_spacing_mm": 200,
                   "stirrup_diameter_mm": 10, "stirrup_spacing_mm": 200}),
        ),
        (
            "column",
            "L2",
            "C1",
            json!({"longitudinal_bar_diameter_mm": 20, "longitudinal_bar_count": 8,
                   "stirrup_diameter_mm": 10, "stirrup_spacing_mm": 150, "stirrup_legs": 2}),
        ),
    ]
}

pub fn evaluate(story: &str, label: &str, reinforcement: &Value) -> Value {
    let dia = reinforcement["stirrup_diameter_mm"].as_f64().unwrap_or(10.0);
    let spacing = reinforcement["stirrup_spacing_mm"].as_f64().unwrap_or(150.0);
    let capacity = 0.75 * 420.0 * (std::f64::consts::PI * dia * dia / 4.0) * 2.0 * 500.0
        / spacing
        / 1000.0;
    let shear_demand = 400.0;
    let combo = if dia >= 12.0 { "0.9D+1.0E" } else { "1.2D+1.6L" };

    json!({
        "story": story,
        "label": label,
        "geometry": {"length_mm": 2000, "thickness_mm": 250},
        "reinforcement": reinforcement,
        "checks": [
            {"mode": "flexure", "demand": 700.0, "capacity": 1000.0, "dcr": 0.7,
             "critical_combination": "1.2D+1.6L"},
            {"mode": "shear", "demand": shear_demand, "capacity": capacity,
             "dcr": shear_demand / capacity, "critical_combination": combo}
        ],
        "critical_combination": combo,
        "pier_type": "wall"
    })
}

fn list_key(category: &str) -> &'static str {
    match category {
        "column" => "column_results",
        "beam" => "beam_results",
        "slab" => "slab_results",
        _ => "results",
    }
}

fn full_batch() -> Value {
    let mut batch = json!({"results": [], "column_results": []});
    for (category, story, label, reinforcement) in base_elements() {
        batch[list_key(category)]
            .as_array_mut()
            .unwrap()
            .push(evaluate(story, label, &reinforcement));
    }
    batch
}

// ========================
// Handlers
// ========================

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy", "version": "1.4.2"}))
}

async fn upload(State(state): State<Arc<MockState>>, mut multipart: Multipart) -> Response {
    let mut received = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.unwrap_or_default();
        received = Some((name, bytes.len()));
    }

    let Some((name, size)) = received else {
        return (StatusCode::BAD_REQUEST, Json(json!({"detail": "No file part"}))).into_response();
    };
    state.uploads.lock().unwrap().push((name, size));

    if size == 0 {
        return Json(json!({"success": false, "error": "Uploaded file is empty"})).into_response();
    }

    let mut summary = json!({"piers": [], "columns": [], "beams": [], "slabs": []});
    for (category, story, label, reinforcement) in base_elements() {
        let list = if category == "column" { "columns" } else { "piers" };
        summary[list].as_array_mut().unwrap().push(json!({
            "story": story, "label": label, "reinforcement": reinforcement
        }));
    }
    Json(json!({"success": true, "session_id": SESSION, "summary": summary})).into_response()
}

async fn analyze(State(state): State<Arc<MockState>>, Json(request): Json<Value>) -> Response {
    state.analyze_requests.lock().unwrap().push(request.clone());

    match request["session_id"].as_str() {
        Some("missing") => {
            return (StatusCode::NOT_FOUND, Json(json!({"error": "Session not found"})))
                .into_response()
        }
        Some("rejected") => {
            return Json(json!({"success": false, "error": "Workbook has no pier forces"}))
                .into_response()
        }
        _ => {}
    }

    let updates = request["element_updates"].as_array().cloned().unwrap_or_default();
    if updates.is_empty() {
        let mut body = full_batch();
        body["success"] = json!(true);
        return Json(body).into_response();
    }

    let mut body = json!({"success": true, "results": [], "column_results": []});
    for update in updates {
        let story = update["story"].as_str().unwrap_or_default();
        let label = update["label"].as_str().unwrap_or_default();
        if state.fail_labels.lock().unwrap().contains(label) {
            return (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded").into_response();
        }
        let Some((category, ..)) = base_elements()
            .into_iter()
            .find(|(_, s, l, _)| *s == story && *l == label)
        else {
            continue;
        };

        let mut reinforcement = update.clone();
        if let Some(obj) = reinforcement.as_object_mut() {
            obj.remove("story");
            obj.remove("label");
        }
        body[list_key(category)]
            .as_array_mut()
            .unwrap()
            .push(evaluate(story, label, &reinforcement));
    }
    Json(body).into_response()
}

fn event(value: Value) -> String {
    format!("data: {}\n\n", value)
}

fn progress_events() -> Vec<String> {
    let elements = base_elements();
    let total = elements.len();
    elements
        .iter()
        .enumerate()
        .map(|(i, (_, story, label, _))| {
            event(json!({"type": "progress", "current": i + 1, "total": total,
                         "label": format!("{}/{}", story, label)}))
        })
        .collect()
}

async fn analyze_stream(Json(request): Json<Value>) -> Response {
    let progress = progress_events();

    let body = match request["session_id"].as_str() {
        Some("stream-error") => {
            let lines = vec![
                progress[0].clone(),
                event(json!({"type": "error", "message": "Pier L1/P2 has no section"})),
            ];
            Body::from_stream(stream::iter(
                lines.into_iter().map(|l| Ok::<_, std::io::Error>(Bytes::from(l))),
            ))
        }
        Some("stream-drop") => {
            let head = stream::iter(vec![Ok(Bytes::from(progress[0].clone()))]);
            let crash = stream::once(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(std::io::Error::new(std::io::ErrorKind::Other, "worker crashed"))
            });
            Body::from_stream(head.chain(crash))
        }
        Some("stream-eof") => Body::from_stream(stream::iter(
            progress
                .into_iter()
                .map(|l| Ok::<_, std::io::Error>(Bytes::from(l))),
        )),
        Some("stream-slow") => {
            let head = stream::iter(vec![Ok(Bytes::from(progress[0].clone()))]);
            let stall = stream::once(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, std::io::Error>(Bytes::new())
            });
            Body::from_stream(head.chain(stall))
        }
        _ => {
            let mut complete = full_batch();
            complete["type"] = json!("complete");

            let mut text = String::from(": keep-alive\n\n");
            for line in progress {
                text.push_str(&line);
            }
            text.push_str(&event(complete));

            // Small uneven chunks so lines and JSON objects straddle boundaries
            let bytes = text.into_bytes();
            let mut chunks = Vec::new();
            let mut start = 0;
            let mut size = 5;
            while start < bytes.len() {
                let end = (start + size).min(bytes.len());
                chunks.push(Ok::<_, std::io::Error>(Bytes::copy_from_slice(&bytes[start..end])));
                start = end;
                size = size % 37 + 11;
            }
            Body::from_stream(stream::iter(chunks))
        }
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(body)
        .unwrap()
}

async fn combinations(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.combination_calls.fetch_add(1, Ordering::SeqCst);
    if params.get("session_id").map(String::as_str) != Some(SESSION) {
        return Json(json!({"success": false, "error": "Session not found"})).into_response();
    }
    let label = params.get("label").cloned().unwrap_or_default();
    Json(json!({
        "success": true,
        "combinations": [
            {"index": 0, "name": "1.2D+1.6L", "axial_kn": 850.0, "moment_major_knm": 120.0,
             "moment_minor_knm": 15.0, "shear_kn": 95.0, "flexure_dcr": 0.62, "shear_dcr": 0.48},
            {"index": 1, "name": format!("0.9D+1.0E {}", label), "axial_kn": 410.0,
             "moment_major_knm": 310.0, "moment_minor_knm": 22.0, "shear_kn": 260.0,
             "flexure_dcr": 0.81}
        ]
    }))
    .into_response()
}

async fn combination_detail(Query(params): Query<HashMap<String, String>>) -> Response {
    match params.get("index").map(String::as_str) {
        Some("0") => Json(json!({
            "success": true,
            "detail": {"name": "1.2D+1.6L", "axial_kn": 850.0, "phi_mn_knm": 410.5}
        }))
        .into_response(),
        _ => Json(json!({"success": false, "error": "Combination index out of range"}))
            .into_response(),
    }
}

async fn report(Json(config): Json<Value>) -> Response {
    if config["project_name"] == "broken" {
        return (
            [(header::CONTENT_TYPE, "text/html")],
            "<html>Report service unavailable</html>",
        )
            .into_response();
    }
    (
        [(header::CONTENT_TYPE, "application/pdf")],
        Bytes::from_static(b"%PDF-1.7\n1 0 obj << /Type /Catalog >> endobj\n%%EOF\n"),
    )
        .into_response()
}
