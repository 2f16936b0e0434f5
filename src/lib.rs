pub mod audio;
pub mod config;
pub mod encoder;
pub mod error;
pub mod nats;
pub mod session;
pub mod voice;

pub use audio::{AudioSettings, DecoderFactory, Mixer, OpusDecoderFactory, PacketDecoder};
pub use config::Config;
pub use encoder::{EncoderInput, EncoderSupervisor};
pub use error::{DecodeError, EncodeError, StartError, StopError};
pub use nats::{NatsClient, NatsVoiceTransport, SpeakingMessage, VoicePacketMessage};
pub use session::{EndReason, SessionController, SessionEvent, SessionSummary};
pub use voice::{MemoryTransport, ParticipantId, PcmPassthroughFactory, TransportEvent, VoiceTransport};
