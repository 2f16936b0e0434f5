pub mod buffer;
pub mod decoder;
pub mod mixer;
pub mod settings;

pub use buffer::{new_speaker_map, SpeakerBuffer, SpeakerMap, WriterGuard};
pub use decoder::{DecoderFactory, OpusDecoder, OpusDecoderFactory, PacketDecoder};
pub use mixer::{mix_frames, FrameSink, Mixer, MixerScheduler, MixerStats};
pub use settings::{AudioSettings, BYTES_PER_SAMPLE};
