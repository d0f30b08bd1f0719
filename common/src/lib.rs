//! Shared building blocks for the payload service.

pub mod config;
pub mod errors;
pub mod middleware;
pub mod models;
