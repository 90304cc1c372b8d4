//! Selfserve portal: configuration, service wiring and the HTTP API.

pub mod config;
pub mod portal;
pub mod server;
