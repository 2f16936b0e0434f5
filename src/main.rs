use anyhow::{Context, Result};
use clap::Parser;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voice_recorder::{
    AudioSettings, Config, DecoderFactory, MemoryTransport, NatsClient, NatsVoiceTransport,
    OpusDecoderFactory, ParticipantId, PcmPassthroughFactory, SessionController, SessionEvent,
    VoiceTransport,
};

#[derive(Parser, Debug)]
#[command(name = "voice-recorder", version, about = "Record a voice channel into one mixed audio file")]
struct Args {
    /// Config file, without extension
    #[arg(long, default_value = "config/recorder")]
    config: String,

    /// Session name; also names the output directory and file
    #[arg(long)]
    session: Option<String>,

    /// Voice channel to record (overrides nats.channel)
    #[arg(long)]
    channel: Option<String>,

    /// Stop automatically after this many seconds
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Record two synthetic speakers instead of a NATS voice channel
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut cfg = Config::load(&args.config)?;
    if let Some(channel) = args.channel {
        cfg.nats.channel = channel;
    }

    let session = args
        .session
        .unwrap_or_else(|| format!("meeting-{}", uuid::Uuid::new_v4()));

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));
    info!("Recordings root: {}", cfg.recording.recordings_path.display());

    let mut demo = None;
    let mut nats = None;
    let (transport, decoders): (Arc<dyn VoiceTransport>, Arc<dyn DecoderFactory>) = if args.demo {
        let memory = Arc::new(MemoryTransport::new());
        demo = Some(Arc::clone(&memory));
        (memory, Arc::new(PcmPassthroughFactory))
    } else {
        let client = NatsClient::connect(&cfg.nats.url).await?;
        let transport = NatsVoiceTransport::new(client.client().clone(), cfg.nats.channel.clone());
        nats = Some(client);
        (Arc::new(transport), Arc::new(OpusDecoderFactory))
    };

    let controller = SessionController::new(&cfg, decoders);
    let mut events = controller.subscribe();

    if let Some(nats) = nats.clone() {
        let mut forward = controller.subscribe();
        tokio::spawn(async move {
            loop {
                match forward.recv().await {
                    Ok(event) => {
                        if let Err(e) = nats.publish_event(&event).await {
                            warn!("Failed to publish session event: {:#}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Session event forwarder lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    controller
        .start(&session, Some(Arc::clone(&transport)))
        .await
        .with_context(|| format!("Failed to start session {}", session))?;

    if let Some(memory) = demo {
        info!("Demo mode: recording two synthetic speakers");
        tokio::spawn(feed_demo_speakers(memory, cfg.audio.clone()));
    }

    let deadline = async {
        match args.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    let ended_on_its_own = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping session");
            false
        }
        _ = deadline => {
            info!("Duration elapsed, stopping session");
            false
        }
        event = wait_for_end(&mut events) => {
            if let Some(event) = event {
                println!("{}", serde_json::to_string_pretty(&event)?);
            }
            true
        }
    };

    if !ended_on_its_own {
        let summary = controller.stop().await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    if let Some(nats) = nats {
        // Let the forwarder publish the final event before flushing
        tokio::time::sleep(Duration::from_millis(100)).await;
        nats.close().await?;
    }

    Ok(())
}

/// Two overlapping tones, one second each, repeating
async fn feed_demo_speakers(transport: Arc<MemoryTransport>, audio: AudioSettings) {
    let speakers = [(ParticipantId(1), 440.0f32), (ParticipantId(2), 660.0f32)];
    let samples = audio.frame_size * audio.channels as usize;
    let packets_per_turn = (1000 / audio.mix_interval_ms.max(1)) as usize;
    let mut phase = 0usize;

    loop {
        for (participant, freq) in speakers {
            if !transport.start_speaking(participant).await {
                return;
            }
            for _ in 0..packets_per_turn {
                let packet: Vec<u8> = (0..samples)
                    .flat_map(|i| {
                        let t = (phase + i) as f32 / audio.sample_rate as f32;
                        let sample = ((2.0 * PI * freq * t).sin() * 8000.0) as i16;
                        sample.to_le_bytes()
                    })
                    .collect();
                phase += samples;
                if !transport.send_packet(participant, packet) {
                    return;
                }
                tokio::time::sleep(audio.mix_interval()).await;
            }
            transport.end_stream(participant);
            if !transport.stop_speaking(participant).await {
                return;
            }
        }
    }
}

/// Resolves once the session stops or fails without being asked to
async fn wait_for_end(events: &mut broadcast::Receiver<SessionEvent>) -> Option<SessionEvent> {
    loop {
        match events.recv().await {
            Ok(event @ (SessionEvent::Stopped { .. } | SessionEvent::Failed { .. })) => {
                return Some(event)
            }
            Ok(SessionEvent::Started { .. }) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
