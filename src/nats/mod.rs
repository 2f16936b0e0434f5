pub mod client;
pub mod messages;
pub mod transport;

pub use client::NatsClient;
pub use messages::{SpeakingMessage, VoicePacketMessage};
pub use transport::NatsVoiceTransport;
