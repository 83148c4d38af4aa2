//! The REST mutation surface. Every handler routes through the write
//! orchestrator; none of them touch the store directly.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use easygrid_core::{Error, Fields, RecordId};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRecordBody {
    pub data: Fields,
    #[serde(default)]
    pub record_id: Option<RecordId>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRecordBody {
    pub data: Fields,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBatchBody {
    pub records: Vec<CreateRecordBody>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBatchItem {
    pub id: RecordId,
    pub data: Fields,
    #[serde(default)]
    pub version: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBatchBody {
    pub records: Vec<UpdateBatchItem>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBatchBody {
    pub record_ids: Vec<RecordId>,
}

/// Renders a record as the REST payload: id, version, document data.
async fn record_payload(state: &AppState, table_id: &str, record_id: &str) -> Result<Value, Error> {
    let record = state
        .orchestrator
        .get_record(table_id, record_id)
        .await
        .ok_or_else(|| Error::record_not_found(table_id, record_id))?;
    let schema = state.orchestrator.schema(table_id).await?;
    Ok(json!({
        "id": record.id,
        "version": record.version,
        "fields": record.document_data(&schema),
    }))
}

pub async fn create_record(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CreateRecordBody>,
) -> Result<Json<Value>, ApiError> {
    state.authorize(&headers)?;
    if let Some(key) = &body.idempotency_key {
        if let Some(cached) = state.orchestrator.cached_response(key) {
            return Ok(Json(cached));
        }
    }
    let (record_id, _outcome) = state
        .orchestrator
        .create_record(&table_id, body.data, body.record_id)
        .await?;
    let response = json!({ "record": record_payload(&state, &table_id, &record_id).await? });
    if let Some(key) = &body.idempotency_key {
        state.orchestrator.cache_response(key, response.clone());
    }
    Ok(Json(response))
}

pub async fn update_record(
    State(state): State<AppState>,
    Path((table_id, record_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<UpdateRecordBody>,
) -> Result<Json<Value>, ApiError> {
    state.authorize(&headers)?;
    if let Some(key) = &body.idempotency_key {
        if let Some(cached) = state.orchestrator.cached_response(key) {
            return Ok(Json(cached));
        }
    }
    state
        .orchestrator
        .update_record(&table_id, &record_id, body.data, body.version)
        .await?;
    let response = json!({ "record": record_payload(&state, &table_id, &record_id).await? });
    if let Some(key) = &body.idempotency_key {
        state.orchestrator.cache_response(key, response.clone());
    }
    Ok(Json(response))
}

pub async fn delete_record(
    State(state): State<AppState>,
    Path((table_id, record_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state.authorize(&headers)?;
    state.orchestrator.delete_record(&table_id, &record_id).await?;
    Ok(Json(json!({ "deleted": record_id })))
}

pub async fn create_records_batch(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CreateBatchBody>,
) -> Result<Json<Value>, ApiError> {
    state.authorize(&headers)?;
    if let Some(key) = &body.idempotency_key {
        if let Some(cached) = state.orchestrator.cached_response(key) {
            return Ok(Json(cached));
        }
    }
    let rows: Vec<Fields> = body.records.into_iter().map(|r| r.data).collect();
    let (ids, _outcome) = state.orchestrator.create_records(&table_id, rows).await?;
    let mut records = Vec::with_capacity(ids.len());
    for id in &ids {
        records.push(record_payload(&state, &table_id, id).await?);
    }
    let response = json!({ "records": records });
    if let Some(key) = &body.idempotency_key {
        state.orchestrator.cache_response(key, response.clone());
    }
    Ok(Json(response))
}

pub async fn update_records_batch(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpdateBatchBody>,
) -> Result<Json<Value>, ApiError> {
    state.authorize(&headers)?;
    if let Some(key) = &body.idempotency_key {
        if let Some(cached) = state.orchestrator.cached_response(key) {
            return Ok(Json(cached));
        }
    }
    let ids: Vec<RecordId> = body.records.iter().map(|r| r.id.clone()).collect();
    let rows = body
        .records
        .into_iter()
        .map(|r| (r.id, r.data, r.version))
        .collect();
    state.orchestrator.update_records(&table_id, rows).await?;
    let mut records = Vec::with_capacity(ids.len());
    for id in &ids {
        records.push(record_payload(&state, &table_id, id).await?);
    }
    let response = json!({ "records": records });
    if let Some(key) = &body.idempotency_key {
        state.orchestrator.cache_response(key, response.clone());
    }
    Ok(Json(response))
}

pub async fn delete_records_batch(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<DeleteBatchBody>,
) -> Result<Json<Value>, ApiError> {
    state.authorize(&headers)?;
    let deleted = body.record_ids.clone();
    state
        .orchestrator
        .delete_records(&table_id, body.record_ids)
        .await?;
    Ok(Json(json!({ "deleted": deleted })))
}
