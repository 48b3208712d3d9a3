mod calibration;
mod command;
mod config;
mod device;
mod error;
mod host;
mod protocol;
mod queue;
mod session;
mod stats;
mod transport;
#[cfg(test)]
mod test_support;

use anyhow::Context;
use clap::Parser;
use config::Config;
use device::{ DeviceCommand, DeviceState };
use host::VirtualInputHost;
use session::Session;
use stats::Stats;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{ AsyncBufReadExt, BufReader };
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{ debug, error, info, warn };

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber
        ::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter
                ::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let session_config = config.session_config()?;

    info!(
        client = format!("{}:{}", config.client_address, config.client_port),
        ports = format!("{}..{}", config.server_port_min, config.server_port_max),
        tick_hz = config.tick_hz,
        interactive = config.interactive,
        "🚀 esp32-osc-bridge starting"
    );

    let host = Arc::new(VirtualInputHost::new());
    let mut session = Session::new(session_config, host.clone(), Stats::new());

    // Spawn stats reporter
    let stats_clone = session.stats().clone();
    let stats_interval = config.stats_interval_secs;
    tokio::spawn(async move {
        stats::stats_reporter(stats_clone, stats_interval).await;
    });

    session.connect().await.context("session connect")?;
    if session.config().interactive {
        // Startup stands in for pressing Connect.
        if let Err(e) = session.announce_now() {
            warn!(error = %e, "announce failed");
        }
    }

    // Commands from stdin (JSON lines) → session's device
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<DeviceCommand>(64);
    if config.stdio {
        tokio::spawn(read_commands(cmd_tx));
    } else {
        drop(cmd_tx);
    }

    info!("✅ All systems go — waiting for the ESP32");

    let mut ticker = tokio::time::interval(config.tick_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_tick = Instant::now();
    let mut was_active = false;
    let mut was_calibrated = false;
    let mut last_button: Option<bool> = None;
    let mut commands_open = config.stdio;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let elapsed = now - last_tick;
                last_tick = now;

                if !session.is_connected() {
                    match session.reconnect().await {
                        Ok(()) => {
                            was_active = false;
                            was_calibrated = false;
                        }
                        Err(e) => {
                            debug!(error = %e, "reconnect pending");
                            continue;
                        }
                    }
                }

                if let Err(e) = session.tick(elapsed) {
                    warn!(error = %e, "tick failed, reconnecting");
                    if let Err(e) = session.reconnect().await {
                        error!(error = %e, "reconnect failed");
                    }
                    was_active = false;
                    was_calibrated = false;
                    continue;
                }

                let Some(device) = session.device() else { continue };

                let active = session.is_device_active();
                if active && !was_active {
                    info!(
                        serial = %host.descriptor(device).map(|d| d.serial).unwrap_or_default(),
                        local = ?session.local_address(),
                        port = session.bound_server_port(),
                        "📡 ESP32 online"
                    );
                }
                was_active = active;

                let calibration = session.calibration();
                if calibration.is_set && !was_calibrated {
                    info!(zero = format!("{:.4}", calibration.zero_value), "🎯 encoder zeroed");
                }
                was_calibrated = calibration.is_set;

                if let Some(state) = session.current_state() {
                    if last_button != Some(state.button) {
                        info!(pressed = state.button, encoder = format!("{:.3}", state.encoder), "🔘 button");
                        last_button = Some(state.button);
                    }
                }

                for state in host.drain_events(device) {
                    if config.stdio {
                        emit_state(&state);
                    }
                }
            }
            cmd = cmd_rx.recv(), if commands_open => {
                let Some(cmd) = cmd else {
                    commands_open = false;
                    continue;
                };
                let Some(device) = session.device() else {
                    warn!(kind = cmd.kind(), "command dropped, not connected");
                    continue;
                };
                let routed = match cmd {
                    DeviceCommand::HapticEvent { event_id } => host.send_haptic_event(device, event_id),
                    DeviceCommand::MotorSpeed { speed } => host.send_motor_speed(device, speed),
                };
                if let Err(e) = routed {
                    warn!(kind = cmd.kind(), error = %e, "command failed");
                }
            }
            _ = &mut shutdown => {
                info!("🛑 shutting down");
                break;
            }
        }
    }

    // Leave the motor idle before letting go of the device.
    if let Some(device) = session.device() {
        if let Err(e) = host.stop_motor(device) {
            warn!(error = %e, "stop motor on exit failed");
        }
    }
    session.disconnect().await;
    Ok(())
}

async fn read_commands(tx: mpsc::Sender<DeviceCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<DeviceCommand>(line) {
                    Ok(cmd) => {
                        if tx.send(cmd).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, line, "bad command line"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        }
    }
    debug!("stdin command reader stopped");
}

fn emit_state(state: &DeviceState) {
    match serde_json::to_string(state) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "state serialize failed"),
    }
}
