//! 路由模块

use axum::Router;

use crate::handlers;
use crate::state::AppState;

/// Every path is served by the payload handler.
pub fn router() -> Router<AppState> {
    Router::new().fallback(handlers::serve_payload)
}
