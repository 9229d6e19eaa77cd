use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::events::Subscription;
use crate::feathers::Feather;
use crate::id::new_uuid_v7;
use crate::pipeline::{Method, Request};
use crate::settings::{self, SaveSettings};
use crate::state::{close_session, AppState};
use crate::tools::{self, Filter};
use crate::workbooks::{self, Workbook};

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

fn current_user(headers: &HeaderMap) -> String {
    headers
        .get("x-user")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("admin")
        .to_string()
}

/// Resolve a spinal-case route segment to a feather. Plural segments mean a
/// filtered query, singular segments an insert.
async fn resolve_data_segment(
    state: &AppState,
    segment: &str,
) -> AppResult<(String, bool)> {
    let mut conn = state.engine.pool.acquire().await.map_err(AppError::from)?;
    let names = state.engine.catalog.names(&mut *conn).await?;
    for (name, _) in &names {
        if tools::to_spinal_case(name) == segment {
            return Ok((name.clone(), false));
        }
    }
    for (name, plural) in &names {
        if let Some(plural) = plural {
            if tools::to_spinal_case(plural) == segment {
                return Ok((name.clone(), true));
            }
        }
    }
    Err(AppError::not_found(format!("Unknown route: {segment}")))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct QueryBody {
    #[serde(flatten)]
    filter: Filter,
    subscription: Option<Subscription>,
    show_deleted: bool,
}

async fn data_post(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let (feather, is_query) = resolve_data_segment(&state, &segment).await?;
    let user = current_user(&headers);
    let request = if is_query {
        let query: QueryBody =
            serde_json::from_value(body).map_err(AppError::from)?;
        Request {
            method: Method::Get,
            name: feather,
            user,
            filter: Some(query.filter),
            subscription: query.subscription,
            show_deleted: query.show_deleted,
            ..Request::default()
        }
    } else {
        Request {
            method: Method::Post,
            name: feather,
            user,
            data: body,
            ..Request::default()
        }
    };
    let value = state.engine.request(request, false).await?;
    Ok(Json(value))
}

async fn data_get(
    State(state): State<AppState>,
    Path((segment, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let (feather, _) = resolve_data_segment(&state, &segment).await?;
    let request = Request {
        method: Method::Get,
        name: feather,
        id: Some(id.clone()),
        user: current_user(&headers),
        ..Request::default()
    };
    let value = state.engine.request(request, false).await?;
    if value.is_null() {
        return Err(AppError::not_found(format!("Record not found: {id}")));
    }
    Ok(Json(value))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WriteQuery {
    event_key: Option<String>,
    is_hard: bool,
}

async fn data_patch(
    State(state): State<AppState>,
    Path((segment, id)): Path<(String, String)>,
    Query(query): Query<WriteQuery>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let (feather, _) = resolve_data_segment(&state, &segment).await?;
    let request = Request {
        method: Method::Patch,
        name: feather,
        id: Some(id),
        user: current_user(&headers),
        data: body,
        event_key: query.event_key,
        ..Request::default()
    };
    let value = state.engine.request(request, false).await?;
    Ok(Json(value))
}

async fn data_delete(
    State(state): State<AppState>,
    Path((segment, id)): Path<(String, String)>,
    Query(query): Query<WriteQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let (feather, _) = resolve_data_segment(&state, &segment).await?;
    let request = Request {
        method: Method::Delete,
        name: feather,
        id: Some(id),
        user: current_user(&headers),
        event_key: query.event_key,
        is_hard: query.is_hard,
        ..Request::default()
    };
    let value = state.engine.request(request, false).await?;
    Ok(Json(value))
}

async fn feather_get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Feather>, AppError> {
    let mut conn = state.engine.pool.acquire().await.map_err(AppError::from)?;
    let feather = state.engine.catalog.feather(&mut *conn, &name).await?;
    Ok(Json(feather))
}

async fn feather_put(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(mut spec): Json<Feather>,
) -> Result<Json<Value>, AppError> {
    if spec.name.is_empty() {
        spec.name = tools::spinal_to_pascal(&name);
    }
    let mut tx = state.engine.pool.begin().await.map_err(AppError::from)?;
    state.engine.catalog.save_feather(&mut *tx, spec).await?;
    tx.commit().await.map_err(AppError::from)?;
    Ok(Json(Value::Bool(true)))
}

async fn feather_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    let mut tx = state.engine.pool.begin().await.map_err(AppError::from)?;
    state.engine.catalog.delete_feather(&mut *tx, &name).await?;
    tx.commit().await.map_err(AppError::from)?;
    Ok(Json(Value::Bool(true)))
}

async fn modules_get(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let mut conn = state.engine.pool.acquire().await.map_err(AppError::from)?;
    Ok(Json(workbooks::get_modules(&mut *conn).await?))
}

async fn settings_get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    let mut conn = state.engine.pool.acquire().await.map_err(AppError::from)?;
    let settings = settings::get_settings(&mut *conn, &name)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Settings not found: {name}")))?;
    Ok(Json(serde_json::to_value(settings).map_err(AppError::from)?))
}

async fn settings_put(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let save = SaveSettings {
        name,
        data: body.get("data").cloned().unwrap_or(body.clone()),
        etag: body
            .get("etag")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        definition: body.get("definition").cloned(),
    };
    let mut tx = state.engine.pool.begin().await.map_err(AppError::from)?;
    let saved = settings::save_settings(&mut *tx, &save).await?;
    tx.commit().await.map_err(AppError::from)?;
    Ok(Json(serde_json::to_value(saved).map_err(AppError::from)?))
}

async fn settings_definition_get(
    State(state): State<AppState>,
) -> Result<Json<Value>, AppError> {
    let mut conn = state.engine.pool.acquire().await.map_err(AppError::from)?;
    Ok(Json(settings::settings_definition(&mut *conn).await?))
}

async fn workbooks_get(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let mut conn = state.engine.pool.acquire().await.map_err(AppError::from)?;
    let workbooks = workbooks::get_workbooks(&mut *conn).await?;
    Ok(Json(serde_json::to_value(workbooks).map_err(AppError::from)?))
}

async fn workbook_get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    let mut conn = state.engine.pool.acquire().await.map_err(AppError::from)?;
    let workbook = workbooks::get_workbook(&mut *conn, &name)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Workbook not found: {name}")))?;
    Ok(Json(serde_json::to_value(workbook).map_err(AppError::from)?))
}

async fn workbook_put(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(mut workbook): Json<Workbook>,
) -> Result<Json<Value>, AppError> {
    if workbook.name.is_empty() {
        workbook.name = name;
    }
    let mut tx = state.engine.pool.begin().await.map_err(AppError::from)?;
    let saved = workbooks::save_workbook(&mut *tx, &workbook).await?;
    tx.commit().await.map_err(AppError::from)?;
    Ok(Json(serde_json::to_value(saved).map_err(AppError::from)?))
}

async fn workbook_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    let mut tx = state.engine.pool.begin().await.map_err(AppError::from)?;
    workbooks::delete_workbook(&mut *tx, &name).await?;
    tx.commit().await.map_err(AppError::from)?;
    Ok(Json(Value::Bool(true)))
}

/// Out-of-band control operations funnel through the pipeline's registered
/// functions. Query parameters and body keys merge, body winning.
async fn do_post(
    State(state): State<AppState>,
    Path(op): Path<String>,
    Query(query): Query<std::collections::HashMap<String, String>>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, AppError> {
    let mut data = serde_json::Map::new();
    for (key, value) in query {
        data.insert(key, Value::String(value));
    }
    if let Some(Json(Value::Object(body))) = body {
        for (key, value) in body {
            data.insert(key, value);
        }
    }
    let request = Request {
        method: Method::Post,
        name: op.clone(),
        user: current_user(&headers),
        data: Value::Object(data.clone()),
        ..Request::default()
    };
    let value = state.engine.request(request, false).await?;

    // A granted lock is remembered against its session so closing the SSE
    // stream can release it by event key.
    if op == "lock" && value == Value::Bool(true) {
        if let (Some(session_id), Some(event_key)) = (
            data.get("sessionId").and_then(|v| v.as_str()),
            data.get("eventKey").and_then(|v| v.as_str()),
        ) {
            state.sessions.track_event_key(session_id, event_key);
        }
    }
    Ok(Json(value))
}

/// Bootstrap: hand the client a session id to connect back with.
async fn sse_bootstrap() -> Json<Value> {
    Json(json!({ "sessionId": new_uuid_v7() }))
}

/// The event stream for one session. Dropping the stream unsubscribes the
/// session and releases its locks.
async fn sse_connect(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.sessions.register(&session_id);
    info!(target = "plume", event = "sse_connected", session = %session_id);

    struct SessionGuard {
        state: AppState,
        session_id: String,
    }
    impl Drop for SessionGuard {
        fn drop(&mut self) {
            let state = self.state.clone();
            let session_id = self.session_id.clone();
            tokio::spawn(async move {
                state.sessions.remove(&session_id);
                let event_keys = state.sessions.take_event_keys(&session_id);
                let _ = close_session(&state.engine, &session_id, &event_keys).await;
            });
        }
    }
    let guard = SessionGuard {
        state: state.clone(),
        session_id: session_id.clone(),
    };

    let stream = ReceiverStream::new(rx).map(move |payload| {
        let _keep_alive = &guard;
        Ok(Event::default().json_data(&payload).unwrap_or_default())
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/data/:name", post(data_post))
        .route(
            "/data/:name/:id",
            get(data_get).patch(data_patch).delete(data_delete),
        )
        .route(
            "/feather/:name",
            get(feather_get).put(feather_put).delete(feather_delete),
        )
        .route("/module", get(modules_get))
        .route("/modules", get(modules_get))
        .route("/settings/:name", get(settings_get).put(settings_put))
        .route("/settings-definition", get(settings_definition_get))
        .route("/workbooks", get(workbooks_get))
        .route(
            "/workbook/:name",
            get(workbook_get).put(workbook_put).delete(workbook_delete),
        )
        .route("/do/:op", post(do_post))
        .route("/sse", get(sse_bootstrap))
        .route("/sse/:session_id", get(sse_connect))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> AppResult<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(AppError::from)?;
    info!(target = "plume", event = "listening", port);
    axum::serve(listener, app)
        .await
        .map_err(AppError::from)?;
    Ok(())
}
