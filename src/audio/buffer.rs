// Per-participant jitter buffer
//
// Decode tasks append PCM at whatever cadence packets arrive; the mixer pulls
// fixed-size chunks on its own clock. The buffer is reset to a fresh empty
// allocation once fully consumed, so memory tracks unconsumed audio only.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::voice::ParticipantId;

/// Concurrent participant -> buffer map shared by decode pipelines and the mixer
pub type SpeakerMap = Arc<DashMap<ParticipantId, Arc<SpeakerBuffer>>>;

pub fn new_speaker_map() -> SpeakerMap {
    Arc::new(DashMap::new())
}

#[derive(Debug, Default)]
struct BufferState {
    /// Decoded s16le PCM
    data: Vec<u8>,
    /// Bytes already consumed by the mixer (always <= data.len())
    position: usize,
    /// Live decode pipelines appending to this buffer
    writers: usize,
}

/// Append-only PCM buffer with a read cursor
#[derive(Debug)]
pub struct SpeakerBuffer {
    participant: ParticipantId,
    state: Mutex<BufferState>,
}

impl SpeakerBuffer {
    pub fn new(participant: ParticipantId) -> Self {
        Self {
            participant,
            state: Mutex::new(BufferState::default()),
        }
    }

    pub fn participant(&self) -> ParticipantId {
        self.participant
    }

    /// Append decoded PCM to the tail
    pub fn append(&self, pcm: &[u8]) {
        if pcm.is_empty() {
            return;
        }
        self.state.lock().data.extend_from_slice(pcm);
    }

    /// Copy up to `max` unconsumed bytes into `out` and advance the cursor.
    ///
    /// Returns the number of bytes consumed. When the cursor reaches the end
    /// the buffer is replaced by a fresh empty one.
    pub fn read_into(&self, out: &mut [u8], max: usize) -> usize {
        let mut state = self.state.lock();
        let available = state.data.len() - state.position;
        let n = available.min(max).min(out.len());

        if n > 0 {
            let start = state.position;
            out[..n].copy_from_slice(&state.data[start..start + n]);
            state.position += n;
        }

        if state.position >= state.data.len() {
            state.data = Vec::new();
            state.position = 0;
        }

        n
    }

    /// Bytes appended but not yet consumed
    pub fn unconsumed(&self) -> usize {
        let state = self.state.lock();
        state.data.len() - state.position
    }

    /// Register a live decode pipeline as writer
    pub fn attach_writer(&self) {
        self.state.lock().writers += 1;
    }

    pub fn detach_writer(&self) {
        let mut state = self.state.lock();
        state.writers = state.writers.saturating_sub(1);
    }

    pub fn has_writers(&self) -> bool {
        self.state.lock().writers > 0
    }

    /// No live pipeline and nothing left to mix
    pub fn is_retired(&self) -> bool {
        let state = self.state.lock();
        state.writers == 0 && state.data.len() == state.position
    }
}

/// Keeps a buffer attached for as long as a decode pipeline holds it.
///
/// Dropping the guard detaches the writer, on every exit path of the task.
pub struct WriterGuard {
    buffer: Arc<SpeakerBuffer>,
}

impl WriterGuard {
    /// Get or create the participant's buffer and attach a writer to it.
    ///
    /// Attachment happens while the map entry is locked so the mixer's
    /// conditional removal can not retire the buffer in between.
    pub fn acquire(map: &SpeakerMap, participant: ParticipantId) -> Self {
        let entry = map
            .entry(participant)
            .or_insert_with(|| Arc::new(SpeakerBuffer::new(participant)));
        entry.attach_writer();
        let buffer = Arc::clone(entry.value());
        drop(entry);

        Self { buffer }
    }

    pub fn buffer(&self) -> &SpeakerBuffer {
        &self.buffer
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.buffer.detach_writer();
    }
}
