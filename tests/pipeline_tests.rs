// Integration tests for per-participant decoding and mixing
//
// These tests drive SpeakerPipeline and Mixer directly, ticking the mixer by
// hand, and verify buffered audio survives speaking-end, decoder failures stay
// local to one participant and buffers are reused and retired correctly.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use voice_recorder::audio::{new_speaker_map, FrameSink, SpeakerMap};
use voice_recorder::error::DecodeError;
use voice_recorder::voice::SpeakerPipeline;
use voice_recorder::{
    AudioSettings, DecoderFactory, MemoryTransport, Mixer, PacketDecoder, ParticipantId,
    PcmPassthroughFactory,
};

/// Keeps every mixed frame
#[derive(Default)]
struct CollectingSink {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl FrameSink for CollectingSink {
    fn try_write(&self, frame: Vec<u8>) -> bool {
        self.frames.lock().push(frame);
        true
    }
}

/// First `create` fails, later ones pass PCM through
#[derive(Default)]
struct FailFirstFactory {
    calls: AtomicUsize,
}

impl DecoderFactory for FailFirstFactory {
    fn create(&self, settings: &AudioSettings) -> Result<Box<dyn PacketDecoder>, DecodeError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(DecodeError::Unavailable("decoder init failed".into()));
        }
        PcmPassthroughFactory.create(settings)
    }

    fn probe(&self, _settings: &AudioSettings) -> Result<(), DecodeError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "fail-first"
    }
}

struct Harness {
    transport: Arc<MemoryTransport>,
    buffers: SpeakerMap,
    pipeline: SpeakerPipeline,
    mixer: Mixer,
    sink: Arc<CollectingSink>,
    settings: AudioSettings,
}

impl Harness {
    fn new(decoders: Arc<dyn DecoderFactory>) -> Self {
        let settings = AudioSettings::default();
        let transport = Arc::new(MemoryTransport::new());
        let buffers = new_speaker_map();
        let sink = Arc::new(CollectingSink::default());
        let pipeline = SpeakerPipeline::new(
            transport.clone(),
            decoders,
            settings.clone(),
            buffers.clone(),
        );
        let mixer = Mixer::new(&settings, buffers.clone(), sink.clone());

        Self {
            transport,
            buffers,
            pipeline,
            mixer,
            sink,
            settings,
        }
    }

    /// One full frame of a constant sample value
    fn frame_of(&self, value: i16) -> Vec<u8> {
        value
            .to_le_bytes()
            .repeat(self.settings.frame_bytes() / 2)
    }

    fn unconsumed(&self, participant: ParticipantId) -> usize {
        self.buffers
            .get(&participant)
            .map(|buffer| buffer.unconsumed())
            .unwrap_or(0)
    }

    fn has_writers(&self, participant: ParticipantId) -> bool {
        self.buffers
            .get(&participant)
            .map(|buffer| buffer.has_writers())
            .unwrap_or(false)
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

fn samples(frame: &[u8]) -> Vec<i16> {
    frame
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[tokio::test]
async fn test_audio_survives_speaking_end() -> Result<()> {
    let h = Harness::new(Arc::new(PcmPassthroughFactory));
    let alice = ParticipantId(1);
    let frame_bytes = h.settings.frame_bytes();

    h.pipeline.on_speaking_start(alice);
    h.transport.send_packet(alice, h.frame_of(1000));
    wait_until(|| h.unconsumed(alice) == frame_bytes).await;

    h.pipeline.on_speaking_end(alice);
    wait_until(|| !h.has_writers(alice)).await;
    assert!(!h.pipeline.is_active(alice));

    // Pipeline is gone but the buffered frame is still mixed
    assert!(h.buffers.contains_key(&alice));
    assert_eq!(h.mixer.tick(), Some(frame_bytes));

    let frames = h.sink.frames.lock().clone();
    assert_eq!(frames.len(), 1);
    assert!(samples(&frames[0]).iter().all(|&s| s == 1000));

    // Detached and fully mixed: retired on that same tick
    assert!(h.buffers.is_empty());
    assert_eq!(h.mixer.stats().buffers_retired(), 1);

    Ok(())
}

#[tokio::test]
async fn test_decoder_failure_skips_only_that_participant() -> Result<()> {
    let h = Harness::new(Arc::new(FailFirstFactory::default()));
    let alice = ParticipantId(1);
    let bob = ParticipantId(2);

    h.pipeline.on_speaking_start(alice);
    wait_until(|| !h.pipeline.is_active(alice) && !h.has_writers(alice)).await;
    assert_eq!(h.pipeline.stats().decoder_failures.load(Ordering::Relaxed), 1);

    h.pipeline.on_speaking_start(bob);
    h.transport.send_packet(bob, h.frame_of(-500));
    wait_until(|| h.unconsumed(bob) == h.settings.frame_bytes()).await;

    h.mixer.tick();
    let frames = h.sink.frames.lock().clone();
    assert!(samples(&frames[0]).iter().all(|&s| s == -500));

    // Alice's empty, writerless buffer was retired; Bob is still speaking
    assert!(!h.buffers.contains_key(&alice));
    assert!(h.buffers.contains_key(&bob));

    h.pipeline.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_speaking_again_reuses_pending_buffer() -> Result<()> {
    let h = Harness::new(Arc::new(PcmPassthroughFactory));
    let alice = ParticipantId(1);
    let frame_bytes = h.settings.frame_bytes();

    h.pipeline.on_speaking_start(alice);
    h.transport.send_packet(alice, h.frame_of(100));
    wait_until(|| h.unconsumed(alice) == frame_bytes).await;
    let first = h.buffers.get(&alice).map(|b| Arc::clone(b.value()));

    h.transport.end_stream(alice);
    h.pipeline.on_speaking_end(alice);
    wait_until(|| !h.has_writers(alice)).await;

    // Speaks again before the mixer caught up
    h.pipeline.on_speaking_start(alice);
    h.transport.send_packet(alice, h.frame_of(200));
    wait_until(|| h.unconsumed(alice) == 2 * frame_bytes).await;

    let second = h.buffers.get(&alice).map(|b| Arc::clone(b.value()));
    assert!(matches!((&first, &second), (Some(a), Some(b)) if Arc::ptr_eq(a, b)));

    h.mixer.tick();
    h.mixer.tick();
    let frames = h.sink.frames.lock().clone();
    assert!(samples(&frames[0]).iter().all(|&s| s == 100));
    assert!(samples(&frames[1]).iter().all(|&s| s == 200));

    // Writer is still attached, so the drained buffer stays
    assert!(h.buffers.contains_key(&alice));
    assert_eq!(h.pipeline.stats().participants(), vec![alice]);

    h.pipeline.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_speaking_start_twice_keeps_one_subscription() -> Result<()> {
    let h = Harness::new(Arc::new(PcmPassthroughFactory));
    let alice = ParticipantId(1);

    h.pipeline.on_speaking_start(alice);
    h.pipeline.on_speaking_start(alice);
    wait_until(|| h.transport.subscribe_calls() >= 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.transport.subscribe_calls(), 1);
    assert_eq!(h.pipeline.active_count(), 1);

    h.pipeline.shutdown().await;
    assert_eq!(h.pipeline.active_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_corrupt_packet_is_skipped() -> Result<()> {
    let h = Harness::new(Arc::new(PcmPassthroughFactory));
    let alice = ParticipantId(1);

    h.pipeline.on_speaking_start(alice);
    h.transport.send_packet(alice, vec![1u8, 2, 3]);
    h.transport.send_packet(alice, h.frame_of(7));
    wait_until(|| h.unconsumed(alice) == h.settings.frame_bytes()).await;

    assert_eq!(h.pipeline.stats().packets_corrupt.load(Ordering::Relaxed), 1);
    assert!(h.pipeline.is_active(alice));

    h.pipeline.shutdown().await;
    Ok(())
}
