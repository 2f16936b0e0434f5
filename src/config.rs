use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::audio::AudioSettings;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub recording: RecordingConfig,
    pub audio: AudioSettings,
    pub encoder: EncoderConfig,
    pub nats: NatsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "voice-recorder".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Root directory; each session gets `<recordings_path>/<name>/`
    pub recordings_path: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            recordings_path: PathBuf::from("meetings"),
        }
    }
}

impl RecordingConfig {
    pub fn session_dir(&self, session: &str) -> PathBuf {
        self.recordings_path.join(session)
    }

    /// A session name must map to exactly one directory directly under the
    /// recordings root.
    pub fn is_valid_session_name(session: &str) -> bool {
        !session.is_empty()
            && session != "."
            && session != ".."
            && !session.contains(['/', '\\', '\0'])
    }

    /// Deterministic output artifact for a session
    pub fn output_path(&self, session: &str) -> PathBuf {
        self.session_dir(session).join(format!("{}.ogg", session))
    }
}

/// External encoder process settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Program name (looked up on PATH) or explicit path
    pub program: String,

    /// Output bitrate handed to the encoder, e.g. "64k"
    pub bitrate: String,

    /// How long `close()` waits for the process before killing it
    pub shutdown_timeout_secs: u64,

    /// Mixed frames queued towards stdin before new frames are dropped
    pub input_queue_frames: usize,

    /// Argument template; `{rate}`, `{channels}`, `{bitrate}` and `{output}`
    /// are substituted. `None` uses the built-in ffmpeg/libopus arguments.
    pub args: Option<Vec<String>>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            bitrate: "64k".to_string(),
            shutdown_timeout_secs: 15,
            input_queue_frames: 250, // 5s of 20ms frames
            args: None,
        }
    }
}

impl EncoderConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    /// Voice channel whose participants are recorded
    pub channel: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            channel: "default".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("RECORDER").separator("__"))
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.audio.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_behavior() {
        let cfg = Config::default();
        assert_eq!(cfg.audio.sample_rate, 48000);
        assert_eq!(cfg.audio.channels, 1);
        assert_eq!(cfg.audio.mix_interval_ms, 20);
        assert_eq!(cfg.audio.end_silence_ms, 200);
        assert_eq!(cfg.encoder.shutdown_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.encoder.bitrate, "64k");
    }

    #[test]
    fn test_output_path_is_derived_from_session_name() {
        let recording = RecordingConfig {
            recordings_path: PathBuf::from("/tmp/meetings"),
        };
        assert_eq!(
            recording.output_path("standup"),
            PathBuf::from("/tmp/meetings/standup/standup.ogg")
        );
    }

    #[test]
    fn test_session_names_stay_under_the_root() {
        assert!(RecordingConfig::is_valid_session_name("standup-2025-10-27"));
        assert!(RecordingConfig::is_valid_session_name("retro.v2"));

        for bad in ["", ".", "..", "../notes", "a/b", "a\\b", "/etc"] {
            assert!(
                !RecordingConfig::is_valid_session_name(bad),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_load_rejects_zero_mix_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recorder.toml");
        std::fs::write(&path, "[audio]\nmix_interval_ms = 0\n").unwrap();

        let err = Config::load(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("mix_interval_ms"));
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                "[encoder]\nprogram = \"/usr/bin/ffmpeg\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let cfg: Config = settings.try_deserialize().unwrap();

        assert_eq!(cfg.encoder.program, "/usr/bin/ffmpeg");
        assert_eq!(cfg.encoder.shutdown_timeout_secs, 15);
        assert_eq!(cfg.audio.frame_size, 960);
    }
}
