//! Headless realtime playback through timer-paced null devices.

use std::path::PathBuf;
use std::sync::Arc;

use montage_common::config::AppConfig;
use montage_render_engine::{NullDevices, PlaybackObserver, RenderEngine, TransportCommand};
use montage_timeline::Direction;

use super::{collaborators, load_edl};

struct ConsoleObserver;

impl PlaybackObserver for ConsoleObserver {
    fn framerate(&self, fps: f64) {
        tracing::debug!(fps, "Presented frame rate");
    }

    fn tracking(&self, secs: f64) {
        print!("\r  Position: {secs:8.3}s  ");
    }
}

pub async fn run(
    config: AppConfig,
    path: PathBuf,
    start: f64,
    end: Option<f64>,
    reverse: bool,
    speed: f64,
) -> anyhow::Result<()> {
    let edl = load_edl(&path)?;
    if speed <= 0.0 {
        anyhow::bail!("Speed must be positive, got {speed}");
    }

    let direction = if reverse {
        Direction::Reverse
    } else {
        Direction::Forward
    };
    // Reverse playback starts at the end of the range.
    let command = TransportCommand {
        start_secs: start,
        end_secs: Some(end.unwrap_or_else(|| edl.duration_secs())),
        direction,
        speed,
        looping: config.playback.loop_playback,
        ..TransportCommand::default()
    };

    println!("Playing {} ({direction:?} at {speed}x)", path.display());

    let (cache, registry) = collaborators(&config);
    let mut engine = RenderEngine::new(config, Arc::new(NullDevices), cache, registry)
        .with_observer(Arc::new(ConsoleObserver));
    engine
        .arm(command, edl)
        .map_err(|e| anyhow::anyhow!("Failed to arm playback: {e}"))?;
    engine
        .start()
        .map_err(|e| anyhow::anyhow!("Failed to start playback: {e}"))?;

    if let Some(shared) = engine.shared() {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shared.interrupt();
            }
        });
    }

    let position = tokio::task::spawn_blocking(move || engine.wait()).await??;
    println!("\nStopped at {position:.3}s");
    Ok(())
}
