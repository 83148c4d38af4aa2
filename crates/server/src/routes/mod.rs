//! Route table.

use axum::routing::{get, patch, post};
use axum::Router;

use crate::state::AppState;

pub mod events;
pub mod fields;
pub mod records;
pub mod socket;

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/socket", get(socket::socket_handler))
        .route("/events", get(events::events_handler))
        .route(
            "/api/v1/tables/:table_id/records",
            post(records::create_record),
        )
        .route(
            "/api/v1/tables/:table_id/records/batch",
            post(records::create_records_batch)
                .patch(records::update_records_batch)
                .delete(records::delete_records_batch),
        )
        .route(
            "/api/v1/tables/:table_id/records/:record_id",
            patch(records::update_record).delete(records::delete_record),
        )
        .route("/api/v1/tables/:table_id/fields", post(fields::create_field))
        .route(
            "/api/v1/tables/:table_id/fields/:field_id",
            patch(fields::update_field).delete(fields::delete_field),
        )
        .with_state(state)
}
