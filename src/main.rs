//! # qxl-bridge
//!
//! Runs a test-pattern compositor against the in-process loopback server:
//! one output, a moving band of damage per frame, every command pulled and
//! released by the server thread.

use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use calloop::EventLoop;
use clap::Parser;
use log::{debug, error, info, warn};

use qxl_bridge::config::expand_home;
use qxl_bridge::{
    BridgeConfig, CalloopCore, CompressionMode, Damage, DamageRegion, DisplayContext,
    LoopbackServer, OutputGeometry, PatternRenderer, QxlBackend, RepaintOutcome, RepaintQueue,
};

/// Milliseconds the host loop waits for events between repaint passes
const DISPATCH_TIMEOUT_MS: u64 = 16;

#[derive(Parser)]
#[command(name = "qxl-bridge")]
#[command(about = "Feed compositor repaints to a SPICE-style server as QXL commands")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/qxl-bridge/qxl-bridge.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Override the server listen address
    #[arg(long)]
    host: Option<String>,

    /// Override the server port
    #[arg(long)]
    port: Option<u16>,

    /// Require this password from viewers
    #[arg(long)]
    password: Option<String>,

    /// Image compression: off, auto-glz, auto-lz, quic, glz, lz, lz4
    #[arg(long)]
    compression: Option<CompressionMode>,

    /// Stop after this many frames have been sent (0 runs until Ctrl+C)
    #[arg(long)]
    frames: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting qxl-bridge");
    info!("📄 Version: {} (built {})", env!("CARGO_PKG_VERSION"), env!("BUILD_DATE"));
    if let Some(commit) = option_env!("GIT_COMMIT") {
        debug!("commit {}", commit);
    }

    let config = load_config(&cli)?;
    info!(
        "🌐 Server endpoint {}:{} ({}, compression {})",
        config.server.addr,
        config.server.port,
        if config.server.requires_auth() { "password" } else { "no auth" },
        config.server.compression
    );

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))
        .context("Failed to install Ctrl-C handler")?;

    let mut event_loop: EventLoop<'static, QxlBackend> =
        EventLoop::try_new().context("Failed to create event loop")?;
    let core = Rc::new(CalloopCore::new(event_loop.handle()));
    let display = DisplayContext::new(&config.display)?;
    let queue = RepaintQueue::new();
    let geometry = OutputGeometry::from(&config.output);

    let mut backend = QxlBackend::new(
        config,
        display,
        core,
        Box::new(PatternRenderer::new(geometry.width, geometry.height)),
        Box::new(queue.clone()),
    )?;
    let server = LoopbackServer::start(Arc::clone(backend.facade()))?;
    let output = backend.create_output(geometry)?;

    info!("✨ qxl-bridge is running on {}", output);

    let mut sent: u64 = 0;
    let mut tick: u32 = 0;
    while running.load(Ordering::SeqCst) {
        for id in queue.take_pending() {
            let damage = if tick == 0 {
                Damage::full(geometry.width, geometry.height)
            } else {
                moving_band(geometry, tick)
            };
            tick = tick.wrapping_add(1);

            match backend.repaint_output(id, &damage) {
                Ok(RepaintOutcome::Sent(image)) => {
                    sent += 1;
                    debug!("{} frame {} sent as {:?}", id, sent, image);
                }
                Ok(outcome) => debug!("{} repaint: {:?}", id, outcome),
                Err(e) if !e.is_fatal() => warn!("⚠️ Repaint of {} skipped: {}", id, e),
                Err(e) => {
                    error!("❌ Repaint of {} failed: {}", id, e);
                    return Err(e.into());
                }
            }
        }

        if cli.frames.is_some_and(|limit| limit > 0 && sent >= limit) {
            info!("🏁 Sent {} frames, stopping", sent);
            break;
        }

        event_loop
            .dispatch(Some(Duration::from_millis(DISPATCH_TIMEOUT_MS)), &mut backend)
            .context("Event loop dispatch failed")?;
    }

    let released = backend.shutdown()?;
    let stats = server.stop()?;
    info!(
        "👋 qxl-bridge shutting down: {} frames sent, {} commands served, {} released at shutdown",
        sent,
        stats.commands,
        released.len()
    );
    Ok(())
}

/// A horizontal band one eighth of the output tall, moving down each frame
fn moving_band(geometry: OutputGeometry, tick: u32) -> Damage {
    let band = (geometry.height / 8).max(1);
    let y = (tick.wrapping_mul(band)) % geometry.height;
    let mut damage = Damage::new();
    damage.add(DamageRegion::new(0, y as i32, geometry.width, band));
    damage
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let path = expand_home(Path::new(&cli.config))?;
    let mut config = if path.exists() {
        match BridgeConfig::load(&path) {
            Ok(config) => {
                info!("✅ Configuration loaded from: {}", path.display());
                config
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {:#}", e);
                return Err(e);
            }
        }
    } else {
        warn!("📝 No configuration at {}, using defaults", path.display());
        BridgeConfig::default()
    };

    if let Some(host) = &cli.host {
        config.server.addr = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(password) = &cli.password {
        config.server.password = Some(password.clone());
    }
    if let Some(compression) = cli.compression {
        config.server.compression = compression;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}
