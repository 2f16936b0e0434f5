//! Voice transport boundary and per-participant decoding
//!
//! The transport is an external collaborator; this module only defines what
//! the recorder consumes from it (speaking signals and packet streams) and the
//! pipelines that turn those packets into buffered PCM.

pub mod mock;
mod participant;
mod pipeline;
mod transport;

pub use mock::{MemoryTransport, PcmPassthroughFactory};
pub use participant::ParticipantId;
pub use pipeline::{PipelineStats, SpeakerPipeline};
pub use transport::{TransportEvent, VoiceTransport};
