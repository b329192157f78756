//! Runlines - a live line-rehearsal server
//!
//! This crate provides:
//! - Session engine pacing a client through a script window
//! - Speech renderer abstraction with a content-addressed cache
//! - Script sources (in-memory and JSON directory)
//! - Practice history in SQLite
//! - WebSocket server

pub mod config;
pub mod history;
pub mod rehearsal;
pub mod script;
pub mod server;
pub mod speech;
pub mod text;

pub use config::Config;
pub use rehearsal::{Engine, EngineSettings};
