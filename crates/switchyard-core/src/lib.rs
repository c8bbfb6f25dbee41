//! Core types, config, errors, and the runtime event source for switchyard.

pub mod config;
pub mod error;
pub mod event_source;
pub mod events;
pub mod types;
