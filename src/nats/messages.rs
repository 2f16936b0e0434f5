use serde::{Deserialize, Serialize};

use crate::voice::ParticipantId;

/// Speaking state change published by the voice gateway
#[derive(Debug, Serialize, Deserialize)]
pub struct SpeakingMessage {
    pub participant_id: ParticipantId,
    pub speaking: bool,
}

/// One compressed voice packet from a participant
#[derive(Debug, Serialize, Deserialize)]
pub struct VoicePacketMessage {
    pub participant_id: ParticipantId,
    pub sequence: u32,
    pub opus: String,  // Base64-encoded Opus packet
    pub timestamp: String,  // RFC3339 timestamp
}

/// Subject carrying speaking signals for a channel
pub fn speaking_subject(channel: &str) -> String {
    format!("voice.{}.speaking", channel)
}

/// Subject carrying one participant's packets
pub fn audio_subject(channel: &str, participant: ParticipantId) -> String {
    format!("voice.{}.audio.{}", channel, participant)
}

/// Subject session events are published on
pub fn events_subject(session: &str) -> String {
    format!("recorder.events.{}", session)
}
