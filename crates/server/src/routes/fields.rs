//! Field management: the in-scope slice of schema change. Cycle
//! detection happens here, at field creation and update, never at op
//! time.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use easygrid_core::{Error, FieldSchema};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn create_field(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
    headers: HeaderMap,
    Json(field): Json<FieldSchema>,
) -> Result<Json<Value>, ApiError> {
    state.authorize(&headers)?;
    state.orchestrator.create_field(&table_id, field.clone()).await?;
    Ok(Json(json!({ "field": field })))
}

pub async fn update_field(
    State(state): State<AppState>,
    Path((table_id, field_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(field): Json<FieldSchema>,
) -> Result<Json<Value>, ApiError> {
    state.authorize(&headers)?;
    if field.id != field_id {
        return Err(ApiError(Error::operation_invalid(
            "field id in path and body disagree",
        )));
    }
    state.orchestrator.update_field(&table_id, field.clone()).await?;
    Ok(Json(json!({ "field": field })))
}

pub async fn delete_field(
    State(state): State<AppState>,
    Path((table_id, field_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state.authorize(&headers)?;
    state.orchestrator.delete_field(&table_id, &field_id).await?;
    Ok(Json(json!({ "deleted": field_id })))
}
