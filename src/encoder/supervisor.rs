// External encoder process supervision
//
// The encoder reads mixed PCM on stdin and writes one compressed file. Frames
// reach stdin through a bounded queue drained by a writer task, so the mixer
// clock never waits on the pipe. A monitor task owns the child process and
// reports exits that happen before `close()` as crashes.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::command::{build_args, locate_program};
use crate::audio::{AudioSettings, FrameSink};
use crate::config::EncoderConfig;
use crate::error::EncodeError;

/// Asynchronous failures reported while the session is running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderEvent {
    Crashed(String),
}

#[derive(Debug, Default)]
pub struct InputStats {
    pub frames_written: AtomicU64,
    pub frames_dropped: AtomicU64,
}

impl InputStats {
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}

/// Non-blocking handle onto the encoder's stdin queue
///
/// Clones share the queue; `close()` on any of them closes it for all.
#[derive(Clone)]
pub struct EncoderInput {
    tx: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    stats: Arc<InputStats>,
}

impl EncoderInput {
    fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            stats: Arc::new(InputStats::default()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn stats(&self) -> &InputStats {
        &self.stats
    }
}

impl FrameSink for EncoderInput {
    fn try_write(&self, frame: Vec<u8>) -> bool {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            // Input already closed: the session is shutting down
            return false;
        };

        match tx.try_send(frame) {
            Ok(()) => {
                self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 250 == 0 {
                    warn!("Encoder input is backed up, {} frames dropped so far", dropped);
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Debug)]
struct ExitOutcome {
    status: io::Result<ExitStatus>,
    forced: bool,
}

impl ExitOutcome {
    fn describe(&self) -> String {
        match &self.status {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {}", e),
        }
    }
}

/// Owns one running encoder process
pub struct EncoderSupervisor {
    output_path: PathBuf,
    input: EncoderInput,
    writer: JoinHandle<()>,
    exit: oneshot::Receiver<ExitOutcome>,
    kill: CancellationToken,
    closing: Arc<AtomicBool>,
    shutdown_timeout: Duration,
}

impl EncoderSupervisor {
    /// Start the encoder for `output_path`.
    ///
    /// Returns the supervisor and the channel on which crashes are reported.
    pub async fn spawn(
        output_path: &Path,
        audio: &AudioSettings,
        config: &EncoderConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EncoderEvent>), EncodeError> {
        let program = locate_program(&config.program)
            .ok_or_else(|| EncodeError::BinaryNotFound(config.program.clone()))?;

        // A stale artifact must not pass for this session's output
        match tokio::fs::remove_file(output_path).await {
            Ok(()) => debug!("Removed stale output {}", output_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove stale output {}: {}", output_path.display(), e),
        }

        let args = build_args(config, audio, output_path);
        info!("Spawning encoder: {} {}", program.display(), args.join(" "));

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => EncodeError::BinaryNotFound(config.program.clone()),
                _ => EncodeError::ProcessSpawnFailed(e),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            EncodeError::ProcessSpawnFailed(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "encoder stdin was not captured",
            ))
        })?;

        let (frame_tx, frame_rx) = mpsc::channel(config.input_queue_frames.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let closing = Arc::new(AtomicBool::new(false));
        let kill = CancellationToken::new();

        let writer = tokio::spawn(write_frames(
            stdin,
            frame_rx,
            event_tx.clone(),
            Arc::clone(&closing),
        ));
        tokio::spawn(monitor_process(
            child,
            kill.clone(),
            event_tx,
            exit_tx,
            Arc::clone(&closing),
        ));

        Ok((
            Self {
                output_path: output_path.to_path_buf(),
                input: EncoderInput::new(frame_tx),
                writer,
                exit: exit_rx,
                kill,
                closing,
                shutdown_timeout: config.shutdown_timeout(),
            },
            event_rx,
        ))
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Cloneable writer handle for the mixer
    pub fn input(&self) -> EncoderInput {
        self.input.clone()
    }

    /// Close stdin, wait (bounded) for the process to exit and verify the
    /// output file.
    pub async fn close(self) -> Result<PathBuf, EncodeError> {
        self.closing.store(true, Ordering::SeqCst);
        self.input.close();

        let mut writer = self.writer;
        let mut exit = self.exit;

        let finished = tokio::time::timeout(self.shutdown_timeout, async {
            if let Err(e) = (&mut writer).await {
                warn!("Encoder writer task panicked: {}", e);
            }
            (&mut exit).await
        })
        .await;

        let outcome = match finished {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    "Encoder did not exit within {:?}, killing it",
                    self.shutdown_timeout
                );
                writer.abort();
                self.kill.cancel();
                exit.await
            }
        };

        let outcome = outcome.map_err(|_| {
            EncodeError::ProcessCrashed("encoder monitor ended without an exit status".into())
        })?;

        match &outcome.status {
            Err(_) => return Err(EncodeError::ProcessCrashed(outcome.describe())),
            Ok(status) if !status.success() && !outcome.forced => {
                return Err(EncodeError::ProcessCrashed(outcome.describe()));
            }
            Ok(status) => info!("Encoder exited: {}", status),
        }

        verify_output(&self.output_path).await?;
        Ok(self.output_path)
    }

    /// Terminate the process without waiting for it to finish encoding
    pub async fn kill(self) {
        self.closing.store(true, Ordering::SeqCst);
        self.input.close();
        self.writer.abort();
        self.kill.cancel();
        if let Ok(outcome) = self.exit.await {
            debug!("Encoder killed: {}", outcome.describe());
        }
    }
}

/// The output counts only if it exists and is non-empty
pub async fn verify_output(path: &Path) -> Result<u64, EncodeError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {
            info!("Recording saved: {} ({} bytes)", path.display(), meta.len());
            Ok(meta.len())
        }
        _ => {
            error!("Encoder output missing: {}", path.display());
            Err(EncodeError::OutputMissing(path.to_path_buf()))
        }
    }
}

async fn write_frames(
    mut stdin: ChildStdin,
    mut frames: mpsc::Receiver<Vec<u8>>,
    events: mpsc::UnboundedSender<EncoderEvent>,
    closing: Arc<AtomicBool>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = stdin.write_all(&frame).await {
            if !closing.load(Ordering::SeqCst) {
                error!("Encoder stdin write failed: {}", e);
                let _ = events.send(EncoderEvent::Crashed(format!("stdin write failed: {}", e)));
            }
            // Dropping the receiver makes further writes no-ops
            return;
        }
    }

    if let Err(e) = stdin.shutdown().await {
        debug!("Encoder stdin shutdown: {}", e);
    }
    debug!("Encoder input closed");
}

async fn monitor_process(
    mut child: Child,
    kill: CancellationToken,
    events: mpsc::UnboundedSender<EncoderEvent>,
    exit: oneshot::Sender<ExitOutcome>,
    closing: Arc<AtomicBool>,
) {
    let outcome = tokio::select! {
        status = child.wait() => ExitOutcome { status, forced: false },
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill encoder: {}", e);
            }
            ExitOutcome { status: child.wait().await, forced: true }
        }
    };

    if !closing.load(Ordering::SeqCst) {
        error!("Encoder exited unexpectedly: {}", outcome.describe());
        let _ = events.send(EncoderEvent::Crashed(format!(
            "exited unexpectedly ({})",
            outcome.describe()
        )));
    }

    let _ = exit.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> EncoderConfig {
        EncoderConfig {
            program: "sh".to_string(),
            args: Some(vec!["-c".into(), script.into(), "{output}".into()]),
            shutdown_timeout_secs: 5,
            ..EncoderConfig::default()
        }
    }

    #[tokio::test]
    async fn test_close_returns_verified_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.raw");

        let (encoder, _events) =
            EncoderSupervisor::spawn(&output, &AudioSettings::default(), &sh("cat > \"$0\""))
                .await
                .unwrap();

        let input = encoder.input();
        assert!(input.try_write(vec![1, 0, 2, 0]));
        assert!(input.try_write(vec![3, 0]));

        let path = encoder.close().await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), vec![1, 0, 2, 0, 3, 0]);
        assert_eq!(input.stats().frames_written(), 2);
    }

    #[tokio::test]
    async fn test_clean_exit_without_file_is_output_missing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("never.ogg");

        let (encoder, _events) =
            EncoderSupervisor::spawn(&output, &AudioSettings::default(), &sh("cat > /dev/null"))
                .await
                .unwrap();
        encoder.input().try_write(vec![0; 32]);

        let err = encoder.close().await.unwrap_err();
        assert!(matches!(err, EncodeError::OutputMissing(p) if p == output));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let config = EncoderConfig {
            program: "no-such-encoder-binary-3f9a".to_string(),
            ..EncoderConfig::default()
        };

        let err = EncoderSupervisor::spawn(
            &dir.path().join("a.ogg"),
            &AudioSettings::default(),
            &config,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, EncodeError::BinaryNotFound(name) if name == config.program));
    }

    #[tokio::test]
    async fn test_early_exit_reports_crash() {
        let dir = tempfile::tempdir().unwrap();
        let (encoder, mut events) = EncoderSupervisor::spawn(
            &dir.path().join("a.ogg"),
            &AudioSettings::default(),
            &sh("exit 3"),
        )
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, EncoderEvent::Crashed(_)));

        // Further writes are dropped, never block
        encoder.input().try_write(vec![0; 4]);
        let err = encoder.close().await.unwrap_err();
        assert!(matches!(err, EncodeError::ProcessCrashed(_)));
    }

    #[tokio::test]
    async fn test_hung_encoder_is_killed_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("hung.ogg");
        let config = EncoderConfig {
            shutdown_timeout_secs: 1,
            ..sh("exec sleep 30")
        };

        let (encoder, _events) =
            EncoderSupervisor::spawn(&output, &AudioSettings::default(), &config)
                .await
                .unwrap();

        let started = std::time::Instant::now();
        let err = encoder.close().await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(err, EncodeError::OutputMissing(_)));
    }

    #[tokio::test]
    async fn test_stale_output_is_removed_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("stale.ogg");
        std::fs::write(&output, b"old recording").unwrap();

        let (encoder, _events) =
            EncoderSupervisor::spawn(&output, &AudioSettings::default(), &sh("cat > /dev/null"))
                .await
                .unwrap();

        assert!(matches!(
            encoder.close().await,
            Err(EncodeError::OutputMissing(_))
        ));
    }
}
