//! Live rehearsal engine.
//!
//! Drives a client through a script window line by line:
//! connection → [`Engine`] → [`scheduler`] → `run_lines.event` frames.
//!
//! Each session is paced by at most one advance task at a time. Sessions
//! leave the [`SessionRegistry`] exactly once, through one of the four
//! [`Outcome`]s, and every departure writes one practice history record.

pub mod engine;
pub mod error;
pub mod prefetch;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod session;

pub use engine::{Engine, EngineSettings};
pub use error::{ProtocolError, RehearsalError};
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::SessionRegistry;
pub use session::Session;

use serde::{Deserialize, Serialize};

pub type SessionId = String;
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RehearsalMode {
    /// Every line is spoken, including the user's own.
    ReadThrough,
    /// Other parts are spoken; the user's lines become timed pauses.
    Practice,
    /// Other parts become silent gaps; the user's lines become pauses.
    SpeedThrough,
}

impl RehearsalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RehearsalMode::ReadThrough => "read_through",
            RehearsalMode::Practice => "practice",
            RehearsalMode::SpeedThrough => "speed_through",
        }
    }

    /// Parse a canonical mode name. Legacy aliases are handled by
    /// [`protocol::resolve_mode`].
    pub fn from_canonical(s: &str) -> Option<Self> {
        match s {
            "read_through" => Some(RehearsalMode::ReadThrough),
            "practice" => Some(RehearsalMode::Practice),
            "speed_through" => Some(RehearsalMode::SpeedThrough),
            _ => None,
        }
    }

    pub fn default_speed(&self) -> f64 {
        match self {
            RehearsalMode::SpeedThrough => 1.3,
            _ => 1.0,
        }
    }
}

/// Why a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Ran off the end of its lines.
    Completed,
    /// Client sent `stop`.
    Stopped,
    /// Owning connection closed.
    Disconnected,
    /// Reaped after the idle TTL.
    Expired,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Stopped => "stopped",
            Outcome::Disconnected => "disconnected",
            Outcome::Expired => "expired",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Outcome::Completed),
            "stopped" => Some(Outcome::Stopped),
            "disconnected" => Some(Outcome::Disconnected),
            "expired" => Some(Outcome::Expired),
            _ => None,
        }
    }
}
