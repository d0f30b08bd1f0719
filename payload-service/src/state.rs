//! Application state for payload service.

use std::sync::Arc;

use common::config::AppConfig;
use common::errors::{AppError, AppResult};

use crate::connector;
use crate::service::PayloadService;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub payload: Arc<PayloadService>,
}

impl AppState {
    /// Creates the state, wiring the provider for the configured mode.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.connect_timeout())
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let provider = connector::from_config(&config.connectivity, http_client);
        let payload = PayloadService::new(provider, config.connect_timeout(), config.query_timeout());

        Ok(Self::with_service(config, payload))
    }

    pub fn with_service(config: AppConfig, payload: PayloadService) -> Self {
        Self {
            config: Arc::new(config),
            payload: Arc::new(payload),
        }
    }
}
