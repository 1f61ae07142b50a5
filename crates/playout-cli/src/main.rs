//! Playout CLI — drives the block-scheduling engine from the command line.
//!
//! ## Modes
//! - `list-devices`: print output endpoints, previously selected first.
//! - `play`: decode one or more files and play them as independent streams,
//!   optionally spread around the listener in 3D.
//! - `tone`: play a generated sine for smoke-testing an output chain.

mod cli;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use glam::Vec3;
use tracing_subscriber::EnvFilter;

use playout_engine::backend::cpal::CpalBackend;
use playout_engine::backend::{BackendRegistry, EndpointId, order_devices};
use playout_engine::config::{EngineConfig, EngineTunables};
use playout_engine::decode::{DecodeConfig, open_file};
use playout_engine::engine::OutputEngine;
use playout_engine::source::SineSource;
use playout_engine::spatial::TrackedPose;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut registry = BackendRegistry::new();
    registry.register(Box::new(CpalBackend::new()));
    let registry = Arc::new(registry);

    let endpoint = args.device.clone().map(EndpointId);

    if matches!(args.cmd, cli::Command::ListDevices) {
        return list_devices(&registry, endpoint.as_ref());
    }
    run_playback(args, registry, endpoint)
}

fn list_devices(registry: &BackendRegistry, selected: Option<&EndpointId>) -> Result<()> {
    let backend = registry
        .default_backend()
        .context("no output backends registered")?;
    let devices = order_devices(backend.enumerate()?, selected);
    for (i, d) in devices.iter().enumerate() {
        println!("#{i}: {} [{}]", d.name, d.id);
    }
    Ok(())
}

fn run_playback(
    args: cli::Args,
    registry: Arc<BackendRegistry>,
    endpoint: Option<EndpointId>,
) -> Result<()> {
    let config = EngineConfig {
        endpoint,
        lookahead_blocks: args.lookahead,
        spatial_model: args.model.into(),
        rolloff: args.rolloff,
        min_distance: args.min_distance,
        max_distance: args.max_distance,
        center_override: args.center,
        ..EngineConfig::default()
    };
    let engine = OutputEngine::start(registry, config, EngineTunables::default())?;

    // Fixed listener at the origin; stream positions move around it.
    engine.tracker().update(TrackedPose {
        valid: true,
        ..TrackedPose::default()
    });

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_handler = interrupted.clone();
    let _ = ctrlc::set_handler(move || {
        interrupted_handler.store(true, Ordering::Relaxed);
    });

    match args.cmd {
        cli::Command::Play { paths, spread } => {
            if paths.is_empty() {
                bail!("no input files");
            }
            let decode_cfg = DecodeConfig {
                buffer_seconds: args.buffer_seconds,
                ..DecodeConfig::default()
            };
            let count = paths.len();
            for (i, path) in paths.iter().enumerate() {
                let mut source =
                    open_file(path, &decode_cfg).with_context(|| format!("open {path:?}"))?;
                if spread {
                    source = source.with_position(spread_position(i, count));
                }
                if let Some(duration_ms) = source.duration_ms() {
                    tracing::info!(path = ?path, duration_ms, "stream queued");
                }
                engine.add_source(Box::new(source))?;
            }
            wait_for_streams(&engine, &interrupted);
        }
        cli::Command::Tone { freq, seconds } => {
            engine.add_source(Box::new(SineSource::new(freq, 0.4).with_duration(seconds)))?;
            wait_for_streams(&engine, &interrupted);
        }
        // Handled before the engine starts.
        cli::Command::ListDevices => {}
    }

    engine.stop();
    let status = engine.status();
    tracing::info!(
        blocks = status.blocks_written,
        misses = status.frame_misses,
        resyncs = status.desync_resyncs,
        "playout finished"
    );
    Ok(())
}

/// Block until every stream has been torn down or Ctrl-C arrives.
fn wait_for_streams(engine: &OutputEngine, interrupted: &Arc<AtomicBool>) {
    while !interrupted.load(Ordering::Relaxed) && !engine.active_players().is_empty() {
        std::thread::sleep(Duration::from_millis(100));
    }
    if interrupted.load(Ordering::Relaxed) {
        tracing::info!("interrupted; stopping");
    }
}

/// Place stream `index` of `count` on a circle of radius 5 around the
/// listener, starting straight ahead.
fn spread_position(index: usize, count: usize) -> Vec3 {
    let angle = std::f32::consts::TAU * index as f32 / count.max(1) as f32;
    Vec3::new(angle.sin() * 5.0, 0.0, angle.cos() * 5.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_position_starts_ahead_of_listener() {
        let p = spread_position(0, 4);
        assert!(p.x.abs() < 1e-5);
        assert!((p.z - 5.0).abs() < 1e-5);
    }

    #[test]
    fn spread_position_distributes_around_circle() {
        let left = spread_position(1, 4);
        let behind = spread_position(2, 4);
        assert!((left.x - 5.0).abs() < 1e-4);
        assert!((behind.z + 5.0).abs() < 1e-4);
        for i in 0..4 {
            let p = spread_position(i, 4);
            assert!((p.length() - 5.0).abs() < 1e-4);
        }
    }
}
