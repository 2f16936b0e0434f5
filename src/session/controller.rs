use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::ActiveSession;
use super::summary::{EndReason, SessionEvent, SessionSummary};
use crate::audio::{new_speaker_map, AudioSettings, DecoderFactory, Mixer, MixerScheduler};
use crate::config::{Config, EncoderConfig, RecordingConfig};
use crate::encoder::{EncoderEvent, EncoderSupervisor};
use crate::error::{EncodeError, StartError, StopError};
use crate::voice::{SpeakerPipeline, TransportEvent, VoiceTransport};

/// Single-session invariant. Only `Idle` admits a new start.
enum SessionSlot {
    Idle,
    Active(Box<ActiveSession>),
    /// Teardown in progress outside the lock
    Stopping(String),
}

struct Inner {
    recording: RecordingConfig,
    audio: AudioSettings,
    encoder: EncoderConfig,
    decoders: Arc<dyn DecoderFactory>,
    slot: Mutex<SessionSlot>,
    completed: SyncMutex<HashSet<String>>,
    events: broadcast::Sender<SessionEvent>,
}

/// Owns the one recording session a process may run at a time
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(config: &Config, decoders: Arc<dyn DecoderFactory>) -> Self {
        let (events, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(Inner {
                recording: config.recording.clone(),
                audio: config.audio.clone(),
                encoder: config.encoder.clone(),
                decoders,
                slot: Mutex::new(SessionSlot::Idle),
                completed: SyncMutex::new(HashSet::new()),
                events,
            }),
        }
    }

    /// Receive session-started/stopped/failed signals
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Seed names recorded by earlier runs so they can not be reused
    pub fn register_completed<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .completed
            .lock()
            .extend(names.into_iter().map(Into::into));
    }

    pub fn completed_sessions(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.completed.lock().iter().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_active(&self) -> bool {
        !matches!(*self.inner.slot.lock().await, SessionSlot::Idle)
    }

    /// Name of the session currently recording (or shutting down)
    pub async fn active_session(&self) -> Option<String> {
        match &*self.inner.slot.lock().await {
            SessionSlot::Idle => None,
            SessionSlot::Active(session) => Some(session.name.clone()),
            SessionSlot::Stopping(name) => Some(name.clone()),
        }
    }

    /// Start recording `name` from `transport`.
    ///
    /// The session lock is held for the invariant checks and while the new
    /// session's handles are installed, never for the recording itself.
    pub async fn start(
        &self,
        name: &str,
        transport: Option<Arc<dyn VoiceTransport>>,
    ) -> Result<(), StartError> {
        let mut slot = self.inner.slot.lock().await;

        if !matches!(*slot, SessionSlot::Idle) {
            return Err(StartError::AlreadyActive);
        }
        if !RecordingConfig::is_valid_session_name(name) {
            return Err(StartError::InvalidName(name.to_string()));
        }
        if self.inner.completed.lock().contains(name) {
            return Err(StartError::DuplicateName(name.to_string()));
        }
        let transport = transport.ok_or(StartError::NoTransport)?;

        self.inner
            .audio
            .validate()
            .map_err(StartError::InvalidSettings)?;
        self.inner
            .decoders
            .probe(&self.inner.audio)
            .map_err(StartError::DecoderUnavailable)?;

        info!(session = %name, transport = transport.name(), "Starting recording session");

        let session = match self.launch(name, Arc::clone(&transport)).await {
            Ok(session) => session,
            Err(e) => {
                error!(session = %name, "Failed to start recording: {}", e);
                if let Err(disconnect) = transport.disconnect().await {
                    warn!(session = %name, "Transport disconnect failed: {:#}", disconnect);
                }
                remove_session_storage(
                    &self.inner.recording.session_dir(name),
                    &self.inner.recording.output_path(name),
                    false,
                )
                .await;
                let _ = self.inner.events.send(SessionEvent::Failed {
                    session: name.to_string(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let started_at = session.started_at;
        *slot = SessionSlot::Active(Box::new(session));
        drop(slot);

        info!(session = %name, "Recording session started");
        let _ = self.inner.events.send(SessionEvent::Started {
            session: name.to_string(),
            at: started_at,
        });

        Ok(())
    }

    /// Stop the active session, drain its audio and finalize the file
    pub async fn stop(&self) -> Result<SessionSummary, StopError> {
        let session = {
            let mut slot = self.inner.slot.lock().await;
            match std::mem::replace(&mut *slot, SessionSlot::Idle) {
                SessionSlot::Active(session) => {
                    *slot = SessionSlot::Stopping(session.name.clone());
                    session
                }
                other => {
                    *slot = other;
                    return Err(StopError::NoActiveSession);
                }
            }
        };

        self.finish(*session, EndReason::Requested)
            .await
            .map_err(StopError::from)
    }

    /// Encoder first, then the mixer clock, then participant admission
    async fn launch(
        &self,
        name: &str,
        transport: Arc<dyn VoiceTransport>,
    ) -> Result<ActiveSession, StartError> {
        let inner = &self.inner;

        let session_dir = inner.recording.session_dir(name);
        tokio::fs::create_dir_all(&session_dir)
            .await
            .map_err(StartError::Storage)?;

        let output_path = inner.recording.output_path(name);
        let (encoder, encoder_events) =
            EncoderSupervisor::spawn(&output_path, &inner.audio, &inner.encoder).await?;
        let input = encoder.input();

        let buffers = new_speaker_map();
        let mixer = Arc::new(Mixer::new(
            &inner.audio,
            buffers.clone(),
            Arc::new(input.clone()),
        ));
        let scheduler = MixerScheduler::spawn(
            Arc::clone(&mixer),
            &inner.audio,
            CancellationToken::new(),
        );

        let transport_events = match transport.events().await {
            Ok(rx) => rx,
            Err(e) => {
                scheduler.stop().await;
                encoder.kill().await;
                remove_session_storage(&session_dir, &output_path, true).await;
                return Err(StartError::Transport(e));
            }
        };

        let pipeline = Arc::new(SpeakerPipeline::new(
            Arc::clone(&transport),
            Arc::clone(&inner.decoders),
            inner.audio.clone(),
            buffers,
        ));

        let events = CancellationToken::new();
        tokio::spawn(route_session_events(
            Arc::downgrade(&self.inner),
            name.to_string(),
            Arc::clone(&pipeline),
            transport_events,
            encoder_events,
            events.clone(),
        ));

        Ok(ActiveSession {
            name: name.to_string(),
            started_at: Utc::now(),
            session_dir,
            transport,
            encoder,
            input,
            mixer,
            scheduler,
            pipeline,
            events,
        })
    }

    /// Teardown triggered from inside the session (transport loss, encoder
    /// crash). Runs only if `name` is still the active session; a concurrent
    /// `stop()` that already claimed it wins.
    async fn abort(&self, name: &str, reason: EndReason) {
        let session = {
            let mut slot = self.inner.slot.lock().await;
            match std::mem::replace(&mut *slot, SessionSlot::Idle) {
                SessionSlot::Active(session) if session.name == name => {
                    *slot = SessionSlot::Stopping(session.name.clone());
                    session
                }
                other => {
                    *slot = other;
                    return;
                }
            }
        };

        if let Err(e) = self.finish(*session, reason).await {
            warn!(session = %name, "Session ended with error: {}", e);
        }
    }

    /// Common tail of every teardown path
    async fn finish(
        &self,
        session: ActiveSession,
        reason: EndReason,
    ) -> Result<SessionSummary, EncodeError> {
        let name = session.name.clone();
        let report = session.teardown(reason).await;

        match &report.result {
            Ok(summary) => {
                self.inner.completed.lock().insert(name.clone());
                info!(
                    session = %name,
                    "Recording session stopped: {} ({:.1}s, {} frames)",
                    summary.output_path.display(),
                    summary.duration_secs,
                    summary.frames_written
                );
                let _ = self.inner.events.send(SessionEvent::Stopped {
                    session: name.clone(),
                    output_path: summary.output_path.clone(),
                    summary: summary.clone(),
                });
            }
            Err(e) => {
                if let EncodeError::OutputMissing(output) = e {
                    remove_session_storage(&report.session_dir, output, true).await;
                }
                error!(session = %name, "Recording session failed: {}", e);
                let _ = self.inner.events.send(SessionEvent::Failed {
                    session: name.clone(),
                    reason: e.to_string(),
                });
            }
        }

        *self.inner.slot.lock().await = SessionSlot::Idle;
        report.result
    }
}

/// Remove what a failed session left behind. The output file is only removed
/// when this session's encoder wrote it; the directory only when it is empty.
async fn remove_session_storage(session_dir: &Path, output: &Path, owns_output: bool) {
    if owns_output {
        match tokio::fs::remove_file(output).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", output.display(), e),
        }
    }

    match tokio::fs::remove_dir(session_dir).await {
        Ok(()) => debug!("Removed session directory {}", session_dir.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Left session directory {} in place: {}",
            session_dir.display(),
            e
        ),
    }
}

/// Routes transport signals into the decode pipeline and turns transport loss
/// or encoder crashes into a teardown.
async fn route_session_events(
    controller: Weak<Inner>,
    session: String,
    pipeline: Arc<SpeakerPipeline>,
    mut transport_events: mpsc::Receiver<TransportEvent>,
    mut encoder_events: mpsc::UnboundedReceiver<EncoderEvent>,
    cancel: CancellationToken,
) {
    let mut encoder_open = true;

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = encoder_events.recv(), if encoder_open => match event {
                Some(EncoderEvent::Crashed(why)) => {
                    error!(session = %session, "Encoder crashed: {}", why);
                    break EndReason::EncoderFailed(why);
                }
                None => encoder_open = false,
            },
            event = transport_events.recv() => match event {
                Some(TransportEvent::SpeakingStarted(id)) => pipeline.on_speaking_start(id),
                Some(TransportEvent::SpeakingEnded(id)) => pipeline.on_speaking_end(id),
                Some(TransportEvent::Disconnected) | None => {
                    warn!(session = %session, "Voice transport disconnected unexpectedly");
                    break EndReason::TransportDisconnected;
                }
            },
        }
    };

    // Teardown cancels this loop's token, so it must run on its own task
    if let Some(inner) = controller.upgrade() {
        let controller = SessionController { inner };
        tokio::spawn(async move {
            controller.abort(&session, reason).await;
        });
    }
}
