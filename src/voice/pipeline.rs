// Per-participant decode pipelines
//
// Each speaking participant gets one task that owns its packet subscription
// and decoder, and appends decoded PCM to the participant's speaker buffer.
// Tearing a pipeline down never touches the buffer itself: the mixer retires
// it once it is both detached and fully mixed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::participant::ParticipantId;
use super::transport::VoiceTransport;
use crate::audio::{AudioSettings, DecoderFactory, SpeakerMap, WriterGuard};

struct PipelineHandle {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub packets_decoded: AtomicU64,
    pub packets_corrupt: AtomicU64,
    pub decoder_failures: AtomicU64,
    participants: Mutex<HashSet<ParticipantId>>,
}

impl PipelineStats {
    /// Distinct participants that opened a pipeline, in id order
    pub fn participants(&self) -> Vec<ParticipantId> {
        let mut heard: Vec<_> = self.participants.lock().iter().copied().collect();
        heard.sort();
        heard
    }
}

struct Shared {
    transport: Arc<dyn VoiceTransport>,
    decoders: Arc<dyn DecoderFactory>,
    settings: AudioSettings,
    buffers: SpeakerMap,
    pipelines: DashMap<ParticipantId, PipelineHandle>,
    stats: PipelineStats,
}

/// Speaker decode pipeline for one recording session
pub struct SpeakerPipeline {
    shared: Arc<Shared>,
    generation: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl SpeakerPipeline {
    pub fn new(
        transport: Arc<dyn VoiceTransport>,
        decoders: Arc<dyn DecoderFactory>,
        settings: AudioSettings,
        buffers: SpeakerMap,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                decoders,
                settings,
                buffers,
                pipelines: DashMap::new(),
                stats: PipelineStats::default(),
            }),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.shared.stats
    }

    /// Participants with a live decode pipeline
    pub fn active_count(&self) -> usize {
        self.shared.pipelines.len()
    }

    pub fn is_active(&self, participant: ParticipantId) -> bool {
        self.shared.pipelines.contains_key(&participant)
    }

    /// Install a decode pipeline for a participant that started speaking.
    ///
    /// No-op when one is already installed. Never waits on the transport:
    /// subscribing happens inside the spawned task.
    pub fn on_speaking_start(&self, participant: ParticipantId) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let entry = match self.shared.pipelines.entry(participant) {
            dashmap::mapref::entry::Entry::Occupied(_) => return,
            dashmap::mapref::entry::Entry::Vacant(entry) => entry,
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        entry.insert(PipelineHandle {
            generation,
            cancel: cancel.clone(),
        });

        // Reuses the buffer left by an immediately preceding utterance
        let guard = WriterGuard::acquire(&self.shared.buffers, participant);
        self.shared.stats.participants.lock().insert(participant);

        debug!(participant = %participant, generation, "Opening decode pipeline");

        let shared = Arc::clone(&self.shared);
        self.tasks.spawn(async move {
            run_pipeline(&shared, participant, guard, cancel).await;
            shared
                .pipelines
                .remove_if(&participant, |_, handle| handle.generation == generation);
        });
    }

    /// Tear down the participant's subscription and decoder.
    ///
    /// The speaker buffer stays in place until the mixer has drained it.
    pub fn on_speaking_end(&self, participant: ParticipantId) {
        if let Some((_, handle)) = self.shared.pipelines.remove(&participant) {
            debug!(participant = %participant, "Closing decode pipeline");
            handle.cancel.cancel();
        }
    }

    /// Cancel every pipeline and wait for all decode tasks to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.shared.pipelines.clear();

        info!(
            "Decode pipelines shut down ({} packets decoded, {} corrupt)",
            self.shared.stats.packets_decoded.load(Ordering::Relaxed),
            self.shared.stats.packets_corrupt.load(Ordering::Relaxed)
        );
    }
}

async fn run_pipeline(
    shared: &Shared,
    participant: ParticipantId,
    guard: WriterGuard,
    cancel: CancellationToken,
) {
    let mut decoder = match shared.decoders.create(&shared.settings) {
        Ok(decoder) => decoder,
        Err(e) => {
            warn!(participant = %participant, "Skipping participant, decoder failed: {}", e);
            shared.stats.decoder_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let subscription = tokio::select! {
        _ = cancel.cancelled() => return,
        sub = shared.transport.subscribe(participant, shared.settings.end_silence()) => sub,
    };

    let mut packets = match subscription {
        Ok(rx) => rx,
        Err(e) => {
            warn!(participant = %participant, "Failed to subscribe to audio: {:#}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            packet = packets.recv() => match packet {
                Some(packet) => match decoder.decode(&packet) {
                    Ok(pcm) => {
                        guard.buffer().append(&pcm);
                        shared.stats.packets_decoded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        debug!(participant = %participant, "Dropping packet: {}", e);
                        shared.stats.packets_corrupt.fetch_add(1, Ordering::Relaxed);
                    }
                },
                None => {
                    debug!(participant = %participant, "Audio stream ended after silence");
                    break;
                }
            }
        }
    }
}
