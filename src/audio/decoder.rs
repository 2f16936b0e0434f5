//! Packet decoders
//!
//! Wraps audiopus behind a small trait so the decode pipeline can be driven
//! by any codec, and tests can feed raw PCM.

use audiopus::{coder::Decoder, Channels, SampleRate};
use tracing::debug;

use super::settings::AudioSettings;
use crate::error::DecodeError;

/// Decodes one compressed voice packet into s16le PCM bytes
pub trait PacketDecoder: Send {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<u8>, DecodeError>;
}

/// Builds one decoder per participant
pub trait DecoderFactory: Send + Sync {
    fn create(&self, settings: &AudioSettings) -> Result<Box<dyn PacketDecoder>, DecodeError>;

    /// Session-start check that at least one decoder can be built
    fn probe(&self, settings: &AudioSettings) -> Result<(), DecodeError> {
        self.create(settings).map(|_| ())
    }

    fn name(&self) -> &str;
}

/// Opus decoder producing interleaved i16 PCM
pub struct OpusDecoder {
    decoder: Decoder,
    channels: usize,
    frame_size: usize,
}

impl OpusDecoder {
    pub fn new(settings: &AudioSettings) -> Result<Self, DecodeError> {
        let sample_rate = opus_sample_rate(settings.sample_rate)?;
        let channels = opus_channels(settings.channels)?;

        let decoder = Decoder::new(sample_rate, channels)
            .map_err(|e| DecodeError::Unavailable(e.to_string()))?;

        debug!(
            "Opus decoder created: {}Hz, {} channels, frame_size={}",
            settings.sample_rate, settings.channels, settings.frame_size
        );

        Ok(Self {
            decoder,
            channels: settings.channels as usize,
            frame_size: settings.frame_size,
        })
    }
}

impl PacketDecoder for OpusDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<u8>, DecodeError> {
        // Opus frames are at most 120ms; size for that instead of the nominal
        // frame so long packets still decode.
        let max_samples = (self.frame_size * 6).max(5760);
        let mut output = vec![0i16; max_samples * self.channels];

        let decoded = self
            .decoder
            .decode(Some(packet), &mut output, false)
            .map_err(|e| DecodeError::Corrupt(e.to_string()))?;

        output.truncate(decoded * self.channels);
        Ok(output.iter().flat_map(|s| s.to_le_bytes()).collect())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OpusDecoderFactory;

impl DecoderFactory for OpusDecoderFactory {
    fn create(&self, settings: &AudioSettings) -> Result<Box<dyn PacketDecoder>, DecodeError> {
        Ok(Box::new(OpusDecoder::new(settings)?))
    }

    fn name(&self) -> &str {
        "opus"
    }
}

fn opus_sample_rate(rate: u32) -> Result<SampleRate, DecodeError> {
    match rate {
        8000 => Ok(SampleRate::Hz8000),
        12000 => Ok(SampleRate::Hz12000),
        16000 => Ok(SampleRate::Hz16000),
        24000 => Ok(SampleRate::Hz24000),
        48000 => Ok(SampleRate::Hz48000),
        other => Err(DecodeError::Unavailable(format!(
            "Opus does not support {}Hz",
            other
        ))),
    }
}

fn opus_channels(channels: u16) -> Result<Channels, DecodeError> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        other => Err(DecodeError::Unavailable(format!(
            "Opus does not support {} channels",
            other
        ))),
    }
}
