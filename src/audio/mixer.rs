// Fixed-clock audio mixer
//
// Every tick pulls exactly one frame's worth of PCM from each participant
// buffer, pads short reads with silence, sums the frames with saturation and
// hands the result to a sink. The output therefore advances at a steady rate
// no matter when (or whether) participants talk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::buffer::{SpeakerBuffer, SpeakerMap};
use super::settings::AudioSettings;

/// Destination for mixed frames
pub trait FrameSink: Send + Sync {
    /// Hand a frame over without blocking. Returns false if it was dropped.
    fn try_write(&self, frame: Vec<u8>) -> bool;
}

/// Counters kept across the lifetime of one mixer
#[derive(Debug, Default)]
pub struct MixerStats {
    pub frames_mixed: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub idle_ticks: AtomicU64,
    pub buffers_retired: AtomicU64,
}

impl MixerStats {
    pub fn frames_mixed(&self) -> u64 {
        self.frames_mixed.load(Ordering::Relaxed)
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected.load(Ordering::Relaxed)
    }

    pub fn idle_ticks(&self) -> u64 {
        self.idle_ticks.load(Ordering::Relaxed)
    }

    pub fn buffers_retired(&self) -> u64 {
        self.buffers_retired.load(Ordering::Relaxed)
    }
}

pub struct Mixer {
    frame_bytes: usize,
    buffers: SpeakerMap,
    sink: Arc<dyn FrameSink>,
    stats: MixerStats,
}

impl Mixer {
    pub fn new(settings: &AudioSettings, buffers: SpeakerMap, sink: Arc<dyn FrameSink>) -> Self {
        let frame_bytes = settings.frame_bytes();

        info!(
            "Audio mixer initialized: {}Hz, {} channels, {}ms ticks ({} bytes/frame)",
            settings.sample_rate, settings.channels, settings.mix_interval_ms, frame_bytes
        );

        Self {
            frame_bytes,
            buffers,
            sink,
            stats: MixerStats::default(),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn stats(&self) -> &MixerStats {
        &self.stats
    }

    /// Run one tick: mix the next frame and forward it to the sink.
    ///
    /// Returns the frame length, or None when nobody has a buffer yet.
    pub fn tick(&self) -> Option<usize> {
        let frame = match self.mix_next_frame() {
            Some(frame) => frame,
            None => {
                self.stats.idle_ticks.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let len = frame.len();
        self.stats.frames_mixed.fetch_add(1, Ordering::Relaxed);
        if !self.sink.try_write(frame) {
            self.stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
        }

        Some(len)
    }

    /// Pull one chunk from every buffer and sum them into a single frame
    pub fn mix_next_frame(&self) -> Option<Vec<u8>> {
        let buffers: Vec<Arc<SpeakerBuffer>> = self
            .buffers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        if buffers.is_empty() {
            return None;
        }

        let mut chunks = Vec::with_capacity(buffers.len());
        for buffer in &buffers {
            // Zero-initialised, so a short read is already silence-padded
            let mut chunk = vec![0u8; self.frame_bytes];
            let read = buffer.read_into(&mut chunk, self.frame_bytes);
            if read < self.frame_bytes {
                debug!(
                    participant = %buffer.participant(),
                    bytes = read,
                    "Padding short chunk with silence"
                );
            }
            chunks.push(chunk);
        }

        let mixed = mix_frames(&chunks, self.frame_bytes);
        self.retire_drained(&buffers);

        Some(mixed)
    }

    /// Flush everything still buffered, one silence-padded frame at a time.
    ///
    /// Runs at least one tick when any buffer exists. Returns frames produced.
    pub fn drain(&self) -> usize {
        let pending = self
            .buffers
            .iter()
            .map(|entry| entry.value().unconsumed())
            .max();

        let frames_needed = match pending {
            None => return 0,
            Some(bytes) => bytes.div_ceil(self.frame_bytes).max(1),
        };

        let mut produced = 0;
        for _ in 0..frames_needed {
            if self.tick().is_none() {
                break;
            }
            produced += 1;
        }

        info!("Mixer drained: {} final frames", produced);
        produced
    }

    /// Remove buffers whose pipeline is gone and whose audio is fully mixed
    fn retire_drained(&self, buffers: &[Arc<SpeakerBuffer>]) {
        for buffer in buffers {
            if !buffer.is_retired() {
                continue;
            }

            // Re-checked under the entry lock; a speaking-start may have
            // attached a new writer since the snapshot.
            let participant = buffer.participant();
            if self
                .buffers
                .remove_if(&participant, |_, b| b.is_retired())
                .is_some()
            {
                self.stats.buffers_retired.fetch_add(1, Ordering::Relaxed);
                debug!(participant = %participant, "Retired drained speaker buffer");
            }
        }
    }
}

/// Sum s16le frames sample by sample with saturating addition
///
/// Every input chunk is expected to be `frame_bytes` long; shorter inputs are
/// treated as silence past their end.
pub fn mix_frames(chunks: &[Vec<u8>], frame_bytes: usize) -> Vec<u8> {
    let sample_count = frame_bytes / 2;
    let mut mixed = vec![0i16; sample_count];

    for chunk in chunks {
        for (out, bytes) in mixed.iter_mut().zip(chunk.chunks_exact(2)) {
            let sample = i16::from_le_bytes([bytes[0], bytes[1]]);
            *out = out.saturating_add(sample);
        }
    }

    let mut frame: Vec<u8> = mixed.iter().flat_map(|s| s.to_le_bytes()).collect();
    // Odd frame lengths keep their trailing byte as silence
    frame.resize(frame_bytes, 0);
    frame
}

/// Drives `Mixer::tick` on a fixed interval until cancelled
pub struct MixerScheduler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl MixerScheduler {
    pub fn spawn(mixer: Arc<Mixer>, settings: &AudioSettings, cancel: CancellationToken) -> Self {
        let period = settings.mix_interval();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            info!("Mixer scheduler started ({:?} ticks)", period);

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            // The first tick of a tokio interval completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        mixer.tick();
                    }
                }
            }

            info!("Mixer scheduler stopped");
        });

        Self { cancel, handle }
    }

    /// Cancel the clock and wait for the tick task to exit.
    ///
    /// No tick runs after this returns.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Mixer task panicked: {}", e);
        }
    }
}
