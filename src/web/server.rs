use std::pin::Pin;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use super::page::{MessageView, PageView, SessionSummary};
use super::AppState;
use crate::chat::{ChatSession, Message, ThemeConfig};
use crate::error::{ApiError, ApiResult};
use crate::events::TurnEvent;
use crate::render::{self, TurnContext};

const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OcrMode {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
}

impl From<&ChatSession> for SessionView {
    fn from(session: &ChatSession) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title.clone(),
            messages: session.messages.clone(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/current", get(current_session).delete(delete_current))
        .route("/api/sessions/current/clear", post(clear_current))
        .route("/api/sessions/current/title", put(rename_current))
        .route("/api/sessions/:id/select", post(select_session))
        .route("/api/config", get(get_config).put(put_config))
        .route("/api/ocr-mode", put(put_ocr_mode))
        .route("/api/chat", post(chat_handler))
        .route("/api/ocr", post(ocr_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Html<String>> {
    let mut ui = state.ui.lock().await;
    let manager = state.open_manager(&mut ui).await?;
    let config = state.store.load_config().await;
    let current = manager.current()?;

    let view = PageView {
        title: current.title.clone(),
        theme: config.theme,
        ocr_mode: ui.ocr_mode,
        query: query.q.clone(),
        sessions: manager
            .search(&query.q)
            .into_iter()
            .map(|s| SessionSummary::new(s, manager.current_id()))
            .collect(),
        messages: current.messages.iter().map(MessageView::from).collect(),
    };

    Ok(Html(state.pages.render(&view)?))
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    let mut ui = state.ui.lock().await;
    let manager = state.open_manager(&mut ui).await?;
    let sessions = manager
        .search(&query.q)
        .into_iter()
        .map(|s| SessionSummary::new(s, manager.current_id()))
        .collect();
    Ok(Json(sessions))
}

async fn create_session(State(state): State<Arc<AppState>>) -> ApiResult<Json<SessionView>> {
    let mut ui = state.ui.lock().await;
    let mut manager = state.open_manager(&mut ui).await?;
    let view = SessionView::from(manager.new_session().await?);
    ui.remember(&manager);
    Ok(Json(view))
}

async fn current_session(State(state): State<Arc<AppState>>) -> ApiResult<Json<SessionView>> {
    let mut ui = state.ui.lock().await;
    let manager = state.open_manager(&mut ui).await?;
    Ok(Json(SessionView::from(manager.current()?)))
}

async fn select_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionView>> {
    let mut ui = state.ui.lock().await;
    let mut manager = state.open_manager(&mut ui).await?;
    let view = match manager.select(&id) {
        Ok(session) => SessionView::from(session),
        Err(_) => return Err(ApiError::NotFound(format!("chat session {}", id))),
    };
    ui.remember(&manager);
    Ok(Json(view))
}

async fn clear_current(State(state): State<Arc<AppState>>) -> ApiResult<Json<SessionView>> {
    let mut ui = state.ui.lock().await;
    let mut manager = state.open_manager(&mut ui).await?;
    manager.clear_current().await?;
    Ok(Json(SessionView::from(manager.current()?)))
}

async fn delete_current(State(state): State<Arc<AppState>>) -> ApiResult<Json<SessionView>> {
    let mut ui = state.ui.lock().await;
    let mut manager = state.open_manager(&mut ui).await?;
    manager.delete_current().await?;
    ui.remember(&manager);
    Ok(Json(SessionView::from(manager.current()?)))
}

async fn rename_current(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RenameRequest>,
) -> ApiResult<Json<SessionView>> {
    let mut ui = state.ui.lock().await;
    let mut manager = state.open_manager(&mut ui).await?;
    manager.rename_current(&request.title).await?;
    Ok(Json(SessionView::from(manager.current()?)))
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<ThemeConfig> {
    Json(state.store.load_config().await)
}

async fn put_config(
    State(state): State<Arc<AppState>>,
    Json(config): Json<ThemeConfig>,
) -> ApiResult<Json<ThemeConfig>> {
    state.store.save_config(&config).await?;
    info!("Theme set to {:?}", config.theme);
    Ok(Json(config))
}

async fn put_ocr_mode(
    State(state): State<Arc<AppState>>,
    Json(mode): Json<OcrMode>,
) -> Json<OcrMode> {
    let mut ui = state.ui.lock().await;
    ui.ocr_mode = mode.enabled;
    Json(mode)
}

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, axum::BoxError>> + Send>>;
type TurnSse = Sse<EventStream>;

/// Relay turn events to the browser until the turn task drops its sender.
fn turn_stream(mut rx: mpsc::UnboundedReceiver<TurnEvent>) -> TurnSse {
    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let item: Result<Event, axum::BoxError> = Event::default()
                .event(event.name())
                .json_data(&event)
                .map_err(Into::into);
            yield item;
        }
    };

    let stream: EventStream = Box::pin(stream);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<TurnSse> {
    let prompt = request.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(ApiError::BadRequest("prompt is empty".into()));
    }

    let mut ui = state.ui.clone().lock_owned().await;
    let mut manager = state.open_manager(&mut ui).await?;
    let (tx, rx) = mpsc::unbounded_channel();

    // The turn runs to completion even if the browser goes away.
    tokio::spawn(async move {
        let ctx = TurnContext {
            generator: state.generator.as_ref(),
            model: &state.model,
        };
        let result = render::text_turn(&mut manager, &ctx, &prompt, |event| {
            let _ = tx.send(event);
        })
        .await;

        if let Err(e) = result {
            error!("Chat turn failed: {:#}", e);
            let _ = tx.send(TurnEvent::Failed(format!("{:#}", e)));
        }
        ui.remember(&manager);
    });

    Ok(turn_stream(rx))
}

async fn read_upload(multipart: &mut Multipart) -> ApiResult<(String, Vec<u8>)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or("upload").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        return Ok((name, bytes.to_vec()));
    }
    Err(ApiError::BadRequest("missing 'file' field".into()))
}

async fn ocr_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let (file_name, upload) = read_upload(&mut multipart).await?;

    let mut ui = state.ui.clone().lock_owned().await;
    if !ui.ocr_mode {
        return Err(ApiError::BadRequest("OCR mode is disabled".into()));
    }
    if !ui.uploads.should_process(&file_name) {
        info!("Skipping already processed upload {}", file_name);
        let body = serde_json::json!({ "status": "already_processed" });
        return Ok(Json(body).into_response());
    }

    let mut manager = state.open_manager(&mut ui).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    info!("Processing upload {} ({} bytes)", file_name, upload.len());

    tokio::spawn(async move {
        let ctx = TurnContext {
            generator: state.generator.as_ref(),
            model: &state.model,
        };
        let result = render::image_turn(&mut manager, &ctx, &state.ocr, &upload, |event| {
            let _ = tx.send(event);
        })
        .await;

        match result {
            Ok(outcome) if outcome.consumes_upload() => ui.uploads.mark_processed(),
            Ok(_) => info!("No text found in {}", file_name),
            Err(e) => {
                error!("Image turn failed: {:#}", e);
                let _ = tx.send(TurnEvent::Failed(format!("{:#}", e)));
            }
        }
        ui.remember(&manager);
    });

    Ok(turn_stream(rx).into_response())
}
