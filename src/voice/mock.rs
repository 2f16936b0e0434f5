//! In-process voice transport
//!
//! Lets tests and the `--demo` mode script speaking signals, packets and
//! connection loss without a network. Packets sent before the recorder
//! subscribes are queued for the next subscription.

use anyhow::{bail, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::participant::ParticipantId;
use super::transport::{TransportEvent, VoiceTransport};
use crate::audio::{AudioSettings, DecoderFactory, PacketDecoder};
use crate::error::DecodeError;

const STREAM_CAPACITY: usize = 1024;

struct PendingStream {
    tx: mpsc::Sender<Bytes>,
    rx: Option<mpsc::Receiver<Bytes>>,
}

impl PendingStream {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
pub struct MemoryTransport {
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    streams: Mutex<HashMap<ParticipantId, PendingStream>>,
    connected: AtomicBool,
    disconnect_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    async fn emit(&self, event: TransportEvent) -> bool {
        let tx = self.events.lock().clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn start_speaking(&self, participant: ParticipantId) -> bool {
        self.emit(TransportEvent::SpeakingStarted(participant)).await
    }

    pub async fn stop_speaking(&self, participant: ParticipantId) -> bool {
        self.emit(TransportEvent::SpeakingEnded(participant)).await
    }

    /// Simulate the connection dropping underneath the recorder
    pub async fn drop_connection(&self) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(TransportEvent::Disconnected).await
    }

    /// Queue one packet on the participant's stream
    pub fn send_packet(&self, participant: ParticipantId, packet: impl Into<Bytes>) -> bool {
        let mut streams = self.streams.lock();
        let stream = streams.entry(participant).or_insert_with(PendingStream::new);
        stream.tx.try_send(packet.into()).is_ok()
    }

    /// End the participant's current stream, as trailing silence would
    pub fn end_stream(&self, participant: ParticipantId) {
        self.streams.lock().remove(&participant);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl VoiceTransport for MemoryTransport {
    async fn events(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        if !self.is_connected() {
            bail!("memory transport is disconnected");
        }
        let (tx, rx) = mpsc::channel(256);
        *self.events.lock() = Some(tx);
        Ok(rx)
    }

    async fn subscribe(
        &self,
        participant: ParticipantId,
        _end_after_silence: Duration,
    ) -> Result<mpsc::Receiver<Bytes>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        let mut streams = self.streams.lock();
        let stream = streams.entry(participant).or_insert_with(PendingStream::new);
        let rx = match stream.rx.take() {
            Some(rx) => rx,
            None => {
                // Previous subscription still owns the receiver; start a new stream
                let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
                stream.tx = tx;
                rx
            }
        };

        Ok(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.events.lock().take();
        self.streams.lock().clear();
        debug!("Memory transport disconnected");
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Treats every packet as raw s16le PCM
#[derive(Debug, Default, Clone, Copy)]
pub struct PcmPassthroughFactory;

struct PcmPassthrough;

impl PacketDecoder for PcmPassthrough {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<u8>, DecodeError> {
        if packet.len() % 2 != 0 {
            return Err(DecodeError::Corrupt(format!(
                "odd PCM packet length {}",
                packet.len()
            )));
        }
        Ok(packet.to_vec())
    }
}

impl DecoderFactory for PcmPassthroughFactory {
    fn create(&self, _settings: &AudioSettings) -> Result<Box<dyn PacketDecoder>, DecodeError> {
        Ok(Box::new(PcmPassthrough))
    }

    fn name(&self) -> &str {
        "pcm-passthrough"
    }
}
