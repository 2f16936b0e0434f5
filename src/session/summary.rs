use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::voice::ParticipantId;

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Explicit `stop()`
    Requested,
    /// The voice transport dropped underneath the session
    TransportDisconnected,
    /// The encoder process died while recording
    EncoderFailed(String),
}

/// Final report of a completed recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session: String,

    /// The compressed audio file, verified to exist and be non-empty
    pub output_path: PathBuf,

    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,

    /// Wall-clock duration in seconds
    pub duration_secs: f64,

    /// Frames produced by the mixer, including the final drain
    pub frames_mixed: u64,

    /// Frames accepted by the encoder input
    pub frames_written: u64,

    /// Frames dropped because the encoder input was backed up
    pub frames_dropped: u64,

    /// Participants that were heard at least once
    pub participants: Vec<ParticipantId>,

    pub ended_by: EndReason,
}

/// Signals raised towards whatever drives the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        session: String,
        at: DateTime<Utc>,
    },
    Stopped {
        session: String,
        output_path: PathBuf,
        summary: SessionSummary,
    },
    Failed {
        session: String,
        reason: String,
    },
}

impl SessionEvent {
    pub fn session(&self) -> &str {
        match self {
            SessionEvent::Started { session, .. }
            | SessionEvent::Stopped { session, .. }
            | SessionEvent::Failed { session, .. } => session,
        }
    }
}
