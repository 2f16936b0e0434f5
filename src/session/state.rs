// State owned by one active recording
//
// Everything a recording holds lives in `ActiveSession` and is released by a
// single ordered teardown, shared by explicit stop, transport loss and
// encoder failure.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::summary::{EndReason, SessionSummary};
use crate::audio::{Mixer, MixerScheduler};
use crate::encoder::{EncoderInput, EncoderSupervisor};
use crate::error::EncodeError;
use crate::voice::{SpeakerPipeline, VoiceTransport};

pub(crate) struct ActiveSession {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub session_dir: PathBuf,
    pub transport: Arc<dyn VoiceTransport>,
    pub encoder: EncoderSupervisor,
    pub input: EncoderInput,
    pub mixer: Arc<Mixer>,
    pub scheduler: MixerScheduler,
    pub pipeline: Arc<SpeakerPipeline>,
    /// Stops the session's transport/encoder event loop
    pub events: CancellationToken,
}

/// What a teardown produced, success or not
pub(crate) struct TeardownReport {
    pub result: Result<SessionSummary, EncodeError>,
    pub session_dir: PathBuf,
}

impl ActiveSession {
    /// Release every resource of the session, in order, even if a step fails.
    ///
    /// The first hard failure is reported; later steps still run.
    pub async fn teardown(self, reason: EndReason) -> TeardownReport {
        info!(session = %self.name, "Tearing down session ({:?})", reason);

        let mut first_error = match &reason {
            EndReason::EncoderFailed(why) => Some(EncodeError::ProcessCrashed(why.clone())),
            _ => None,
        };

        // (a) no new ticks, no new participants
        self.events.cancel();
        self.scheduler.stop().await;

        // (b) flush what is still buffered, silence-padded
        let drained = self.mixer.drain();
        info!(session = %self.name, "Final drain wrote {} frames", drained);

        // (c) + (d) close stdin, bounded wait, verify the file
        let output = match self.encoder.close().await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(session = %self.name, "Encoder finished with error: {}", e);
                first_error.get_or_insert(e);
                None
            }
        };

        // (e) decode pipelines; buffers go with the mixer
        self.pipeline.shutdown().await;

        // (f) leave the voice connection
        if let Err(e) = self.transport.disconnect().await {
            warn!(session = %self.name, "Transport disconnect failed: {:#}", e);
        }

        let stopped_at = Utc::now();
        let result = match (first_error, output) {
            (Some(e), _) => Err(e),
            (None, Some(output_path)) => Ok(SessionSummary {
                session: self.name.clone(),
                output_path,
                started_at: self.started_at,
                stopped_at,
                duration_secs: stopped_at
                    .signed_duration_since(self.started_at)
                    .num_milliseconds() as f64
                    / 1000.0,
                frames_mixed: self.mixer.stats().frames_mixed(),
                frames_written: self.input.stats().frames_written(),
                frames_dropped: self.input.stats().frames_dropped(),
                participants: self.pipeline.stats().participants(),
                ended_by: reason,
            }),
            (None, None) => Err(EncodeError::ProcessCrashed(
                "encoder produced no result".into(),
            )),
        };

        TeardownReport {
            result,
            session_dir: self.session_dir,
        }
    }
}
