//! Shared application state.

use std::sync::Arc;

use axum::http::HeaderMap;

use easygrid_broker::Hub;
use easygrid_engine::WriteOrchestrator;

use crate::auth::{bearer_from_header, AuthProvider};
use crate::error::ApiError;

/// State handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub orchestrator: Arc<WriteOrchestrator>,
    pub auth: Arc<AuthProvider>,
}

impl AppState {
    /// Verifies the bearer token of a plain HTTP request.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_from_header);
        self.auth.verify(token).map_err(ApiError)
    }

    /// Verifies a token that may come from either the `Authorization`
    /// header or a `token` query parameter (WebSocket and SSE clients).
    pub fn authorize_upgrade(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<(), ApiError> {
        let token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_from_header)
            .or(query_token);
        self.auth.verify(token).map_err(ApiError)
    }
}
