// Integration tests for the NATS message formats
//
// These tests verify the JSON shapes of voice gateway messages, the subject
// layout per channel, and the session events published to the event bus.

use base64::Engine;
use chrono::Utc;
use std::path::PathBuf;
use voice_recorder::nats::messages::{audio_subject, events_subject, speaking_subject};
use voice_recorder::{
    EndReason, ParticipantId, SessionEvent, SessionSummary, SpeakingMessage, VoicePacketMessage,
};

#[test]
fn test_voice_packet_serialization() {
    let msg = VoicePacketMessage {
        participant_id: ParticipantId(1234),
        sequence: 17,
        opus: base64::engine::general_purpose::STANDARD.encode([0xfcu8, 0xff, 0xfe]),
        timestamp: "2025-10-27T14:30:00Z".to_string(),
    };

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"participant_id\":1234"));
    assert!(json.contains("\"sequence\":17"));

    let deserialized: VoicePacketMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(deserialized.participant_id, ParticipantId(1234));
    assert_eq!(deserialized.sequence, 17);

    let packet = base64::engine::general_purpose::STANDARD
        .decode(&deserialized.opus)
        .unwrap();
    assert_eq!(packet, vec![0xfc, 0xff, 0xfe]);
}

#[test]
fn test_speaking_message_deserialization() {
    let json = r#"{
        "participant_id": 98765432101234,
        "speaking": false
    }"#;

    let msg: SpeakingMessage = serde_json::from_str(json).unwrap();
    assert_eq!(msg.participant_id, ParticipantId(98765432101234));
    assert!(!msg.speaking);
}

#[test]
fn test_subjects_per_channel() {
    assert_eq!(speaking_subject("general"), "voice.general.speaking");
    assert_eq!(
        audio_subject("general", ParticipantId(5)),
        "voice.general.audio.5"
    );
    assert_eq!(events_subject("standup"), "recorder.events.standup");
}

#[test]
fn test_session_event_tagging() {
    let failed = SessionEvent::Failed {
        session: "standup".to_string(),
        reason: "encoder crashed".to_string(),
    };
    let json = serde_json::to_string(&failed).unwrap();
    assert!(json.contains("\"event\":\"failed\""));
    assert!(json.contains("\"session\":\"standup\""));

    let now = Utc::now();
    let stopped = SessionEvent::Stopped {
        session: "standup".to_string(),
        output_path: PathBuf::from("meetings/standup/standup.ogg"),
        summary: SessionSummary {
            session: "standup".to_string(),
            output_path: PathBuf::from("meetings/standup/standup.ogg"),
            started_at: now,
            stopped_at: now,
            duration_secs: 0.0,
            frames_mixed: 3,
            frames_written: 3,
            frames_dropped: 0,
            participants: vec![ParticipantId(1)],
            ended_by: EndReason::TransportDisconnected,
        },
    };
    let json = serde_json::to_string(&stopped).unwrap();
    assert!(json.contains("\"event\":\"stopped\""));
    assert!(json.contains("\"ended_by\":\"transport_disconnected\""));

    let parsed: SessionEvent = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.session(), "standup");
}
