//! Library crate for game-scheduler, exposing modules for binaries and integration tests.

/// Runtime configuration loaded at startup.
pub mod config;
/// Persistence: models, the schedule store and its backends.
pub mod dao;
/// Request, response and delivery payloads.
pub mod dto;
/// Service and HTTP error types.
pub mod error;
/// HTTP routes.
pub mod routes;
/// Scheduling logic, the daemon and its collaborators.
pub mod services;
/// Shared application state.
pub mod state;
