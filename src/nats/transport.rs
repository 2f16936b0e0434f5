// Voice transport over NATS
//
// A voice gateway publishes speaking signals and per-participant Opus packets
// for one channel. Trailing-silence detection happens here: a participant
// stream is closed once no packet arrived for the configured window.

use anyhow::{Context, Result};
use async_nats::{Client, Message};
use base64::Engine;
use bytes::Bytes;
use futures::stream::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{audio_subject, speaking_subject, SpeakingMessage, VoicePacketMessage};
use crate::voice::{ParticipantId, TransportEvent, VoiceTransport};

/// Upper bound on waiting for a participant's first packet
const FIRST_PACKET_WAIT: Duration = Duration::from_secs(30);

pub struct NatsVoiceTransport {
    client: Client,
    channel: String,
    closed: CancellationToken,
}

impl NatsVoiceTransport {
    pub fn new(client: Client, channel: impl Into<String>) -> Self {
        Self {
            client,
            channel: channel.into(),
            closed: CancellationToken::new(),
        }
    }
}

fn parse_speaking(msg: &Message) -> Option<TransportEvent> {
    match serde_json::from_slice::<SpeakingMessage>(&msg.payload) {
        Ok(m) if m.speaking => Some(TransportEvent::SpeakingStarted(m.participant_id)),
        Ok(m) => Some(TransportEvent::SpeakingEnded(m.participant_id)),
        Err(e) => {
            warn!("Failed to parse speaking message: {}", e);
            None
        }
    }
}

fn parse_packet(msg: &Message) -> Option<Bytes> {
    let packet = match serde_json::from_slice::<VoicePacketMessage>(&msg.payload) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("Failed to parse voice packet message: {}", e);
            return None;
        }
    };

    match base64::engine::general_purpose::STANDARD.decode(&packet.opus) {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(e) => {
            warn!(
                participant = %packet.participant_id,
                "Invalid base64 in voice packet {}: {}", packet.sequence, e
            );
            None
        }
    }
}

#[async_trait::async_trait]
impl VoiceTransport for NatsVoiceTransport {
    async fn events(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let subject = speaking_subject(&self.channel);
        let mut subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .context("Failed to subscribe to speaking signals")?;

        info!("Subscribed to {}", subject);

        let (tx, rx) = mpsc::channel(256);
        let closed = self.closed.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = tx.closed() => break,
                    msg = subscriber.next() => match msg {
                        Some(msg) => {
                            if let Some(event) = parse_speaking(&msg) {
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                        None => {
                            // Subscription closed underneath us: connection lost
                            let _ = tx.send(TransportEvent::Disconnected).await;
                            break;
                        }
                    }
                }
            }
            debug!("Speaking signal forwarder stopped");
        });

        Ok(rx)
    }

    async fn subscribe(
        &self,
        participant: ParticipantId,
        end_after_silence: Duration,
    ) -> Result<mpsc::Receiver<Bytes>> {
        let subject = audio_subject(&self.channel, participant);
        let mut subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .with_context(|| format!("Failed to subscribe to {}", subject))?;

        debug!(participant = %participant, "Subscribed to {}", subject);

        let (tx, rx) = mpsc::channel(512);
        let closed = self.closed.clone();

        tokio::spawn(async move {
            // The silence window only starts counting after the first packet
            let mut heard = false;

            loop {
                let window = if heard {
                    end_after_silence
                } else {
                    FIRST_PACKET_WAIT
                };

                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = tx.closed() => break,
                    msg = tokio::time::timeout(window, subscriber.next()) => match msg {
                        Ok(Some(msg)) => {
                            heard = true;
                            if let Some(packet) = parse_packet(&msg) {
                                if tx.send(packet).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(_) => {
                            debug!(participant = %participant, "Stream ended after {:?} of silence", window);
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        info!("Leaving voice channel {}", self.channel);
        self.closed.cancel();
        self.client
            .flush()
            .await
            .context("Failed to flush NATS connection")?;
        Ok(())
    }

    fn name(&self) -> &str {
        "nats"
    }
}
