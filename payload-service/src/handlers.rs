//! Handler模块

use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
};

use crate::state::AppState;

/// `GET <any path>`: the payload table as plain text.
///
/// The status line is committed only after the query has produced its first
/// result; earlier failures map to an error status with an empty body.
pub async fn serve_payload(State(state): State<AppState>, method: Method) -> Response {
    if method != Method::GET {
        return StatusCode::NOT_IMPLEMENTED.into_response();
    }

    tracing::debug!(mode = state.config.connectivity.mode(), "Serving payload");

    match state.payload.open_stream().await {
        Ok(stream) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            stream.into_body(),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}
