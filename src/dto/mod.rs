/// Daemon status payload.
pub mod daemon;
/// Messages handed to dispatchers.
pub mod delivery;
/// Health check payload.
pub mod health;
/// Scheduling requests and views.
pub mod schedule;
/// Server-sent event frames.
pub mod sse;
/// Custom validator functions.
pub mod validation;
