//! Local IPC daemon for the UI surface and the host shell.
//!
//! The library UI calls the engine over plain request/response routes and
//! long-polls `/api/updates` for the `items_updated` signal. The host shell
//! forwards keyboard-hook and capture-surface events to the overlay
//! controller via `/api/overlay/event` and long-polls
//! `/api/overlay/surface` for rendering instructions. Neither side ever
//! reads `vault/*` files directly.

use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    eid::Eid,
    engine::Engine,
    errors::EngineError,
    items::Item,
    overlay::{ChordKey, ControllerHandle, InputEvent, SurfaceSink, SurfaceUpdate},
};

/// How long a long-poll request waits before returning "nothing new"
const LONG_POLL: Duration = Duration::from_secs(25);

#[derive(Clone)]
struct SharedState {
    engine: Arc<Engine>,
    controller: ControllerHandle,
    surface: Arc<SurfaceBus>,
}

/// Broadcasts surface updates to every connected long-poll client.
pub struct SurfaceBus {
    subscribers: Mutex<Vec<mpsc::Sender<SurfaceUpdate>>>,
}

impl Default for SurfaceBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfaceBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self) -> mpsc::Receiver<SurfaceUpdate> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

impl SurfaceSink for SurfaceBus {
    fn update(&self, update: SurfaceUpdate) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(update.clone()).is_ok());
    }
}

pub fn start_daemon(
    engine: Arc<Engine>,
    controller: ControllerHandle,
    surface: Arc<SurfaceBus>,
    addr: &str,
) {
    let addr = addr.to_string();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async {
            start_app(engine, controller, surface, &addr).await;
        });
}

async fn start_app(
    engine: Arc<Engine>,
    controller: ControllerHandle,
    surface: Arc<SurfaceBus>,
    addr: &str,
) {
    let shared_state = SharedState {
        engine,
        controller,
        surface,
    };

    let app = Router::new()
        .route("/api/items", get(list_items))
        .route("/api/items/{id}", delete(delete_item))
        .route("/api/search", get(search))
        .route("/api/ingest/text", post(ingest_text))
        .route("/api/ingest/link", post(ingest_link))
        .route("/api/ingest/file", post(ingest_file))
        .route("/api/updates", get(updates))
        .route("/api/overlay/event", post(overlay_event))
        .route("/api/overlay/surface", get(overlay_surface))
        .with_state(shared_state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind daemon address");
    log::info!("dv daemon listening on {addr}");
    axum::serve(listener, app).await.expect("daemon failed");
}

fn http_error(err: EngineError) -> (StatusCode, String) {
    let status = match &err {
        EngineError::InvalidInput(_) | EngineError::FileRejected(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::DuplicateId(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.reason())
}

#[derive(Deserialize)]
struct ListParams {
    category: Option<String>,
}

async fn list_items(
    State(state): State<SharedState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Item>>, (StatusCode, String)> {
    let filter = params
        .category
        .as_deref()
        .and_then(crate::cli::parse_category);

    tokio::task::block_in_place(|| state.engine.list(filter))
        .map(Json)
        .map_err(http_error)
}

async fn delete_item(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let id = Eid::from(id);
    tokio::task::block_in_place(|| state.engine.delete(&id))
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(http_error)
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
    k: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    item: Item,
    score: f32,
}

async fn search(
    State(state): State<SharedState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<SearchResponse>>, (StatusCode, String)> {
    let k = params.k.unwrap_or(10);

    tokio::task::block_in_place(|| state.engine.search(&params.q, k))
        .map(|hits| {
            Json(
                hits.into_iter()
                    .map(|h| SearchResponse {
                        item: h.item,
                        score: h.score,
                    })
                    .collect(),
            )
        })
        .map_err(http_error)
}

#[derive(Deserialize)]
struct IngestTextBody {
    text: String,
}

async fn ingest_text(
    State(state): State<SharedState>,
    Json(body): Json<IngestTextBody>,
) -> Result<Json<Item>, (StatusCode, String)> {
    tokio::task::block_in_place(|| state.engine.ingest_text(&body.text))
        .map(Json)
        .map_err(http_error)
}

#[derive(Deserialize)]
struct IngestLinkBody {
    url: String,
    title: Option<String>,
}

async fn ingest_link(
    State(state): State<SharedState>,
    Json(body): Json<IngestLinkBody>,
) -> Result<Json<Item>, (StatusCode, String)> {
    tokio::task::block_in_place(|| state.engine.ingest_link(&body.url, body.title.as_deref()))
        .map(Json)
        .map_err(http_error)
}

#[derive(Deserialize)]
struct IngestFileBody {
    path: PathBuf,
}

async fn ingest_file(
    State(state): State<SharedState>,
    Json(body): Json<IngestFileBody>,
) -> Result<Json<Item>, (StatusCode, String)> {
    tokio::task::block_in_place(|| state.engine.ingest_file(&body.path))
        .map(Json)
        .map_err(http_error)
}

#[derive(Serialize)]
struct UpdatesResponse {
    updated: bool,
}

/// Long-poll: resolves when the item set changes, or after the window.
async fn updates(State(state): State<SharedState>) -> Json<UpdatesResponse> {
    let rx = state.engine.subscribe();

    let updated = tokio::task::spawn_blocking(move || rx.recv_timeout(LONG_POLL).is_ok())
        .await
        .unwrap_or(false);

    Json(UpdatesResponse { updated })
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireKey {
    Modifier,
    Activator,
}

impl From<WireKey> for ChordKey {
    fn from(key: WireKey) -> Self {
        match key {
            WireKey::Modifier => ChordKey::Modifier,
            WireKey::Activator => ChordKey::Activator,
        }
    }
}

/// Overlay events as posted by the host shell.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OverlayEventBody {
    KeyDown { key: WireKey },
    KeyUp { key: WireKey },
    DragEnter,
    DragLeave,
    Drop { paths: Vec<PathBuf> },
    TextSubmit { text: String },
    Paste { text: String },
    Cancel,
    DismissError,
}

async fn overlay_event(
    State(state): State<SharedState>,
    Json(body): Json<OverlayEventBody>,
) -> StatusCode {
    let event = match body {
        OverlayEventBody::KeyDown { key } => InputEvent::KeyDown(key.into()),
        OverlayEventBody::KeyUp { key } => InputEvent::KeyUp(key.into()),
        OverlayEventBody::DragEnter => InputEvent::DragEnter,
        OverlayEventBody::DragLeave => InputEvent::DragLeave,
        OverlayEventBody::Drop { paths } => InputEvent::Drop(paths),
        OverlayEventBody::TextSubmit { text } => InputEvent::TextSubmit(text),
        OverlayEventBody::Paste { text } => InputEvent::Paste(text),
        OverlayEventBody::Cancel => InputEvent::Cancel,
        OverlayEventBody::DismissError => InputEvent::DismissError,
    };

    state.controller.post(event);
    StatusCode::ACCEPTED
}

/// Long-poll: the next rendering instruction for the capture surface.
async fn overlay_surface(State(state): State<SharedState>) -> Json<Option<SurfaceUpdate>> {
    let rx = state.surface.subscribe();

    let update = tokio::task::spawn_blocking(move || rx.recv_timeout(LONG_POLL).ok())
        .await
        .unwrap_or(None);

    Json(update)
}
