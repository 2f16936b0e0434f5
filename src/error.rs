//! Error types for the recording core

use std::path::PathBuf;
use thiserror::Error;

/// Failure to turn one participant's packets into PCM. Never fatal to a
/// running session; the participant is logged and skipped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decoder unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt packet: {0}")]
    Corrupt(String),
}

/// Encoder process failures. All of them end the session.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encoder binary not found: {0}")]
    BinaryNotFound(String),

    #[error("failed to spawn encoder process: {0}")]
    ProcessSpawnFailed(#[source] std::io::Error),

    #[error("encoder process crashed: {0}")]
    ProcessCrashed(String),

    #[error("encoder exited without producing {}", .0.display())]
    OutputMissing(PathBuf),
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("a recording session is already active")]
    AlreadyActive,

    #[error("a session named '{0}' already exists")]
    DuplicateName(String),

    #[error("invalid session name '{0}'")]
    InvalidName(String),

    #[error("invalid audio settings: {0:#}")]
    InvalidSettings(#[source] anyhow::Error),

    #[error("no voice transport available")]
    NoTransport,

    #[error("no working audio decoder: {0}")]
    DecoderUnavailable(#[source] DecodeError),

    #[error("failed to prepare session storage: {0}")]
    Storage(#[source] std::io::Error),

    #[error(transparent)]
    Encoder(#[from] EncodeError),

    #[error("voice transport error: {0:#}")]
    Transport(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("no active recording session")]
    NoActiveSession,

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_missing_names_the_path() {
        let err = EncodeError::OutputMissing(PathBuf::from("meetings/a/a.ogg"));
        assert_eq!(
            err.to_string(),
            "encoder exited without producing meetings/a/a.ogg"
        );
    }

    #[test]
    fn test_stop_error_wraps_encode_error_transparently() {
        let err: StopError = EncodeError::ProcessCrashed("exit status: 1".into()).into();
        assert!(matches!(err, StopError::Encode(EncodeError::ProcessCrashed(_))));
        assert_eq!(err.to_string(), "encoder process crashed: exit status: 1");
    }
}
