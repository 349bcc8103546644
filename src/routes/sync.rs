use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    schemas::{
        validate_input, ListingPath, SessionEntriesQuery, SessionPath, SessionsQuery,
        SyncAllInput, SyncListingInput,
    },
    services::sync::ReconcileOutcome,
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/sync/all", axum::routing::post(sync_all))
        .route(
            "/sync/listings/{listing_id}",
            axum::routing::post(sync_listing),
        )
        .route("/sync/sessions", axum::routing::get(list_sessions))
        .route(
            "/sync/sessions/{session_id}",
            axum::routing::get(get_session),
        )
}

async fn sync_all(
    State(state): State<AppState>,
    payload: Option<Json<SyncAllInput>>,
) -> AppResult<Json<Value>> {
    let input = payload.map(|Json(input)| input).unwrap_or_default();
    let engine = state.sync_engine()?;
    let report = engine.sync_all(input.triggered_by).await?;
    Ok(Json(json!({
        "success": report.success,
        "session_id": report.session_id,
        "summary": report.totals,
        "results": report.results.iter().map(result_json).collect::<Vec<_>>(),
        "error": report.error,
    })))
}

async fn sync_listing(
    State(state): State<AppState>,
    Path(path): Path<ListingPath>,
    payload: Option<Json<SyncListingInput>>,
) -> AppResult<Json<Value>> {
    let input = payload.map(|Json(input)| input).unwrap_or_default();
    let engine = state.sync_engine()?;
    let triggered_by = input
        .triggered_by
        .unwrap_or(crate::models::TriggeredBy::Manual);
    let report = engine
        .sync_listing(path.listing_id, input.session_id, triggered_by)
        .await?;
    Ok(Json(json!({
        "success": report.success,
        "session_id": report.session_id,
        "result": result_json(&report.result),
        "error": report.result.error,
    })))
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> AppResult<Json<Value>> {
    validate_input(&query)?;
    let engine = state.sync_engine()?;
    let sessions = engine.store().list_sessions(query.limit).await?;
    Ok(Json(json!({ "data": sessions })))
}

async fn get_session(
    State(state): State<AppState>,
    Path(path): Path<SessionPath>,
    Query(query): Query<SessionEntriesQuery>,
) -> AppResult<Json<Value>> {
    validate_input(&query)?;
    let engine = state.sync_engine()?;
    let session = engine
        .store()
        .get_session(path.session_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("Sync session {} not found.", path.session_id))
        })?;
    let entries = engine
        .store()
        .list_log_entries(path.session_id, query.limit)
        .await?;
    Ok(Json(json!({ "session": session, "entries": entries })))
}

fn result_json(result: &ReconcileOutcome) -> Value {
    json!({
        "listing_id": result.listing_id,
        "listing_name": result.listing_name,
        "status": result.status,
        "error": result.error,
        "counters": result.counters,
    })
}
