use anyhow::Result;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

use super::participant::ParticipantId;

/// Signals the voice transport raises while connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// A participant started sending audio
    SpeakingStarted(ParticipantId),
    /// A participant stopped sending audio
    SpeakingEnded(ParticipantId),
    /// The connection dropped without a local disconnect
    Disconnected,
}

/// Real-time voice connection the recorder listens on
///
/// The recorder never manages channel membership; it only consumes speaking
/// signals and per-participant packet streams.
#[async_trait::async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Start receiving speaking/disconnect signals
    ///
    /// Each call hands out a fresh receiver; the recorder takes one per session.
    async fn events(&self) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Open a packet stream for one participant
    ///
    /// The transport closes the stream after `end_after_silence` without
    /// packets, so pauses shorter than that stay within one stream.
    async fn subscribe(
        &self,
        participant: ParticipantId,
        end_after_silence: Duration,
    ) -> Result<mpsc::Receiver<Bytes>>;

    /// Leave the voice connection and release its resources
    async fn disconnect(&self) -> Result<()>;

    /// Transport name for logging
    fn name(&self) -> &str;
}
