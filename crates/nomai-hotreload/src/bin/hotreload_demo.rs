//! Live hot-reload demo.
//!
//! Spawns a small scene driven by components in `demos/components`, watches
//! the directory, and swaps components in place whenever a file is saved.
//! Edit `Rotator.wat` while it runs and the rotation speed changes without
//! a restart; break it and the previous version keeps spinning.
//!
//! Usage: `hotreload_demo [config.json] [--frames N]`
//!
//! `RUST_LOG=nomai_hotreload=debug` shows every recompile and swap.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use nomai_hotreload::prelude::*;
use nomai_hotreload::SourceWatcher;

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config_path = None;
    let mut max_frames: Option<u64> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--frames" {
            let value = args.next().context("--frames needs a value")?;
            max_frames = Some(value.parse().context("--frames must be an integer")?);
        } else {
            config_path = Some(arg);
        }
    }

    let config = match config_path {
        Some(path) => HotReloadConfig::load(&path)
            .with_context(|| format!("loading config from {path}"))?,
        None => {
            let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/components");
            HotReloadConfig::default()
                .with_component_dir(&demos)
                .with_aux_dir(demos.join("shared"))
        }
    };

    let frame_config = FrameConfig::default();
    let frame_period = Duration::from_secs_f64(frame_config.fixed_dt);
    let mut frames = FrameLoop::from_config(&config, frame_config)?;
    let _watcher = SourceWatcher::spawn(frames.orchestrator().registry().sources(), frames.feed())?;

    let spinner = frames.spawn_with("spinner", Transform::default(), &["Rotator"]);
    let left = frames.spawn_with(
        "left",
        Transform::from_position(Vec3::new(-2.0, 0.0, 0.0)),
        &["Oscillator"],
    );
    let right = frames.spawn_with(
        "right",
        Transform::from_position(Vec3::new(2.0, 1.0, 0.0)),
        &["Oscillator"],
    );
    tracing::info!(
        nodes = frames.scene().node_count(),
        components = frames.scene().component_count(),
        "scene ready; edit files under {} to hot-reload",
        config.component_dir.display()
    );

    loop {
        if let Some(report) = frames.tick() {
            for (name, outcome) in &report.outcomes {
                tracing::info!(pass = report.pass, component = %name, ?outcome, "reload pass");
            }
        }

        if frames.frame_count() % 60 == 0 {
            for node in [spinner, left, right] {
                if let Some(t) = frames.scene().transform(node) {
                    tracing::info!(
                        node = frames.scene().name(node).unwrap_or("?"),
                        position = ?t.position,
                        rotation = ?t.rotation,
                        "transform"
                    );
                }
            }
        }

        if max_frames.is_some_and(|max| frames.frame_count() >= max) {
            break;
        }
        std::thread::sleep(frame_period);
    }

    println!("{}", serde_json::to_string_pretty(&frames.dump_state())?);
    let report = frames.shutdown();
    tracing::info!(released = report.released, failed = report.failed, "shut down");
    Ok(())
}
