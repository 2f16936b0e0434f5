use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bytes per signed 16-bit PCM sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Fixed audio format for one recording session
///
/// Voice packets are decoded straight into this format and the encoder reads
/// it from stdin, so nothing in between resamples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Sample rate in Hz (Opus voice runs at 48kHz)
    pub sample_rate: u32,

    /// Number of interleaved channels (1 = mono)
    pub channels: u16,

    /// Samples per channel in one decoded Opus frame (20ms at 48kHz)
    pub frame_size: usize,

    /// Mixer tick interval in milliseconds
    pub mix_interval_ms: u64,

    /// Trailing silence after which a participant's subscription ends
    pub end_silence_ms: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            frame_size: 960,
            mix_interval_ms: 20,
            end_silence_ms: 200,
        }
    }
}

impl AudioSettings {
    /// Byte length of every mixed frame: rate x bytes/sample x channels x interval
    pub fn frame_bytes(&self) -> usize {
        self.sample_rate as usize
            * BYTES_PER_SAMPLE
            * self.channels as usize
            * self.mix_interval_ms as usize
            / 1000
    }

    /// Reject formats the mixer clock can not run on
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            bail!("audio.sample_rate must be non-zero");
        }
        if self.channels == 0 {
            bail!("audio.channels must be non-zero");
        }
        if self.mix_interval_ms == 0 {
            bail!("audio.mix_interval_ms must be non-zero");
        }

        let frame_bytes = self.frame_bytes();
        let sample_bytes = BYTES_PER_SAMPLE * self.channels as usize;
        if frame_bytes == 0 || frame_bytes % sample_bytes != 0 {
            bail!(
                "{} Hz x {} ms does not give a whole number of samples per frame",
                self.sample_rate,
                self.mix_interval_ms
            );
        }

        Ok(())
    }

    pub fn mix_interval(&self) -> Duration {
        Duration::from_millis(self.mix_interval_ms)
    }

    pub fn end_silence(&self) -> Duration {
        Duration::from_millis(self.end_silence_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes_for_reference_settings() {
        // 48000 * 2 * 1 * 20 / 1000
        assert_eq!(AudioSettings::default().frame_bytes(), 1920);
    }

    #[test]
    fn test_frame_bytes_scales_with_channels_and_interval() {
        let settings = AudioSettings {
            sample_rate: 16000,
            channels: 2,
            mix_interval_ms: 10,
            ..AudioSettings::default()
        };
        assert_eq!(settings.frame_bytes(), 640);
        assert_eq!(settings.mix_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_validate_rejects_unusable_formats() {
        assert!(AudioSettings::default().validate().is_ok());

        let zero_interval = AudioSettings {
            mix_interval_ms: 0,
            ..AudioSettings::default()
        };
        assert!(zero_interval.validate().is_err());

        let no_channels = AudioSettings {
            channels: 0,
            ..AudioSettings::default()
        };
        assert!(no_channels.validate().is_err());

        // 10 Hz x 20 ms rounds down to an empty frame
        let empty_frame = AudioSettings {
            sample_rate: 10,
            ..AudioSettings::default()
        };
        assert_eq!(empty_frame.frame_bytes(), 0);
        assert!(empty_frame.validate().is_err());

        // 75 Hz x 20 ms is 1.5 samples: 3 bytes, not sample aligned
        let split_sample = AudioSettings {
            sample_rate: 75,
            ..AudioSettings::default()
        };
        assert_eq!(split_sample.frame_bytes(), 3);
        assert!(split_sample.validate().is_err());
    }
}
