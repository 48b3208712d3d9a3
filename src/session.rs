//! Session manager: one ESP32 connection.
//!
//! ```text
//!   ESP32 ──UDP──▶ OscListener (tokio task) ──▶ state handler
//!                                                 │ calibrate
//!                                                 ▼
//!                                            StateQueue ◀── tick() drains
//!                                                               │
//!                                  current_state ◀──────────────┤
//!                                  InputHost::push_state ◀──────┘
//!
//!   host command ──▶ CommandChannel ──▶ OscSender ──UDP──▶ ESP32
//!   tick() every 5 s ──▶ /arduino/updateip ──▶ ESP32
//! ```
//!
//! The receive task is the only producer. `tick()` is the only consumer
//! and runs on whatever loop the caller drives. Cross-context state is
//! limited to the queue, the calibration zero point and the liveness timer.

use crate::calibration::{ Calibration, SharedCalibration };
use crate::command::CommandChannel;
use crate::device::{ DeviceDescriptor, DeviceHandle, DeviceState };
use crate::error::{ BridgeError, Result };
use crate::host::InputHost;
use crate::protocol;
use crate::queue::StateQueue;
use crate::stats::Stats;
use crate::transport::{ self, Dispatcher, OscListener, OscSender };
use std::net::{ IpAddr, Ipv4Addr };
use std::ops::Range;
use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::Arc;
use std::time::Duration;
use tracing::{ debug, info, warn };

/// How often the local address is re-sent to the device.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// ESP32 address commands and announcements go to.
    pub client_address: String,
    pub client_port: u16,
    /// Candidate server ports, end exclusive.
    pub server_ports: Range<u16>,
    /// Local interface the listener binds on.
    pub listen_host: IpAddr,
    /// SO_RCVBUF for the listener (0 = OS default).
    pub recv_buf_size: usize,
    pub announce_interval: Duration,
    /// Interactive/editor context: no periodic re-announce.
    pub interactive: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_address: "192.168.45.30".to_string(),
            client_port: 9999,
            server_ports: 8888..8898,
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            recv_buf_size: 256 * 1024,
            announce_interval: ANNOUNCE_INTERVAL,
            interactive: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Liveness
// ═══════════════════════════════════════════════════════════════════════

/// Time since the device last spoke, shared between the receive task
/// (reset) and the tick (advance). Stored as microseconds; `NEVER` until
/// the first inbound message.
#[derive(Debug)]
pub struct Liveness {
    micros: AtomicU64,
}

impl Liveness {
    const NEVER: u64 = u64::MAX;

    pub fn new() -> Self {
        Self { micros: AtomicU64::new(Self::NEVER) }
    }

    pub fn reset(&self) {
        self.micros.store(0, Ordering::Release);
    }

    /// Advance by `elapsed`; no-op until the first reset.
    pub fn advance(&self, elapsed: Duration) {
        let step = u64::try_from(elapsed.as_micros()).unwrap_or(Self::NEVER - 1);
        let _ = self.micros.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            if cur == Self::NEVER { None } else { Some(cur.saturating_add(step).min(Self::NEVER - 1)) }
        });
    }

    pub fn get(&self) -> Option<Duration> {
        match self.micros.load(Ordering::Acquire) {
            Self::NEVER => None,
            us => Some(Duration::from_micros(us)),
        }
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Session
// ═══════════════════════════════════════════════════════════════════════

/// Resources that exist only while connected.
struct Link {
    listener: OscListener,
    sender: Arc<OscSender>,
    queue: Arc<StateQueue>,
    calibration: Arc<SharedCalibration>,
    liveness: Arc<Liveness>,
    local_address: IpAddr,
    device: DeviceHandle,
}

pub struct Session {
    config: SessionConfig,
    host: Arc<dyn InputHost>,
    stats: Arc<Stats>,
    link: Option<Link>,
    current_state: Option<DeviceState>,
    time_since_last_announce: Duration,
}

impl Session {
    pub fn new(config: SessionConfig, host: Arc<dyn InputHost>, stats: Arc<Stats>) -> Self {
        Self {
            config,
            host,
            stats,
            link: None,
            current_state: None,
            time_since_last_announce: Duration::ZERO,
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Bind the listener (first free port in the range), bind the sender,
    /// register the virtual device and announce our address. Interactive
    /// sessions skip the announce; see [`Session::reconnect`].
    ///
    /// Fails without keeping anything bound. Calling it while connected is
    /// a no-op. Must run inside a tokio runtime.
    pub async fn connect(&mut self) -> Result<()> {
        if self.link.is_some() {
            debug!("connect on a connected session ignored");
            return Ok(());
        }

        let remote = transport::resolve_remote(&self.config.client_address, self.config.client_port).await?;
        let (socket, port) = transport::bind_in_range(
            self.config.listen_host,
            self.config.server_ports.clone(),
            self.config.recv_buf_size
        )?;
        let sender = Arc::new(OscSender::bind(remote, self.stats.clone())?);
        let local_address = transport::resolve_local_address(remote);

        let queue = Arc::new(StateQueue::new());
        let calibration = Arc::new(SharedCalibration::new());
        let liveness = Arc::new(Liveness::new());
        let dispatcher = self.dispatcher(&queue, &calibration, &liveness);
        let listener = OscListener::spawn(socket, dispatcher, self.stats.clone())?;

        let descriptor = DeviceDescriptor::esp32(&self.config.client_address, self.config.client_port, port);
        let device = match self.host.register(descriptor) {
            Ok(device) => device,
            Err(e) => {
                sender.close();
                listener.shutdown().await;
                return Err(e);
            }
        };
        let channel = Arc::new(CommandChannel::new(sender.clone(), self.stats.clone()));
        if let Err(e) = self.host.subscribe_commands(device, channel) {
            if let Err(e) = self.host.unregister(device) {
                warn!(device = %device, error = %e, "unregister after failed subscribe");
            }
            sender.close();
            listener.shutdown().await;
            return Err(e);
        }

        self.link = Some(Link {
            listener,
            sender,
            queue,
            calibration,
            liveness,
            local_address,
            device,
        });
        self.current_state = None;
        self.time_since_last_announce = Duration::ZERO;

        info!(
            client = %remote,
            server_port = port,
            local = %local_address,
            device = %device,
            "🔌 session connected"
        );

        if !self.config.interactive {
            self.announce_initial();
        }
        Ok(())
    }

    /// Release everything. Safe to call repeatedly or without a prior
    /// connect; never fails, each step runs regardless of the others.
    pub async fn disconnect(&mut self) {
        self.current_state = None;
        self.time_since_last_announce = Duration::ZERO;

        let Some(link) = self.link.take() else {
            debug!("disconnect on an idle session");
            return;
        };

        if let Err(e) = self.host.unsubscribe_commands(link.device) {
            warn!(device = %link.device, error = %e, "unsubscribe failed");
        }
        if let Err(e) = self.host.unregister(link.device) {
            warn!(device = %link.device, error = %e, "unregister failed");
        }
        link.sender.close();
        let port = link.listener.port();
        link.listener.shutdown().await;

        info!(server_port = port, "📴 session disconnected");
    }

    /// Disconnect, then connect again with fresh calibration and state.
    /// Always announces, interactive or not.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.disconnect().await;
        self.connect().await?;
        if self.config.interactive {
            self.announce_initial();
        }
        Ok(())
    }

    // The device may not be up yet; the periodic announce covers that.
    fn announce_initial(&self) {
        if let Err(e) = self.announce_now() {
            warn!(error = %e, "initial announce failed");
        }
    }

    // ── Consumer tick ──────────────────────────────────────────────────

    /// Drain queued samples, advance timers, re-announce when due.
    ///
    /// Returns how many samples were applied. An error means the outbound
    /// transport is gone and the caller should reconnect.
    pub fn tick(&mut self, elapsed: Duration) -> Result<usize> {
        let Some(link) = self.link.as_ref() else {
            return Ok(0);
        };

        let drained = link.queue.drain();
        let applied = drained.len();
        for state in drained {
            self.host.push_state(link.device, state);
            self.current_state = Some(state);
        }

        link.liveness.advance(elapsed);

        if !self.config.interactive {
            self.time_since_last_announce += elapsed;
            if self.time_since_last_announce > self.config.announce_interval {
                self.time_since_last_announce = Duration::ZERO;
                self.announce_now()?;
            }
        }

        Ok(applied)
    }

    /// Send `"<local_address>:<server_port>"` to the device now.
    pub fn announce_now(&self) -> Result<()> {
        let link = self.link.as_ref().ok_or(BridgeError::NotConnected)?;
        let port = link.listener.port();
        link.sender.send(protocol::announce_message(link.local_address, port))?;
        self.stats.record_announce();
        debug!(remote = %link.sender.remote(), local = %link.local_address, port, "📣 address announced");
        Ok(())
    }

    // ── Inspection ─────────────────────────────────────────────────────

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// `None` while disconnected.
    pub fn bound_server_port(&self) -> Option<u16> {
        self.link.as_ref().map(|l| l.listener.port())
    }

    pub fn local_address(&self) -> Option<IpAddr> {
        self.link.as_ref().map(|l| l.local_address)
    }

    pub fn device(&self) -> Option<DeviceHandle> {
        self.link.as_ref().map(|l| l.device)
    }

    pub fn current_state(&self) -> Option<DeviceState> {
        self.current_state
    }

    /// `None` until the device has sent anything since connect.
    pub fn time_since_last_event(&self) -> Option<Duration> {
        self.link.as_ref().and_then(|l| l.liveness.get())
    }

    /// At least one inbound message since connect.
    pub fn is_device_active(&self) -> bool {
        self.time_since_last_event().is_some()
    }

    #[cfg(test)]
    pub fn time_since_last_announce(&self) -> Duration {
        self.time_since_last_announce
    }

    pub fn calibration(&self) -> Calibration {
        self.link
            .as_ref()
            .map(|l| l.calibration.calibration())
            .unwrap_or_default()
    }

    // ── Inbound handlers (run on the receive task) ─────────────────────

    fn dispatcher(
        &self,
        queue: &Arc<StateQueue>,
        calibration: &Arc<SharedCalibration>,
        liveness: &Arc<Liveness>
    ) -> Dispatcher {
        let mut dispatcher = Dispatcher::new();

        let (queue, calibration, state_liveness, stats) = (
            queue.clone(),
            calibration.clone(),
            liveness.clone(),
            self.stats.clone(),
        );
        dispatcher.add_callback(protocol::ADDR_STATE, move |msg| {
            let raw = protocol::decode_state(msg)?;
            let state = DeviceState {
                encoder: calibration.apply(raw.encoder),
                ..raw
            };
            queue.enqueue(state);
            stats.record_snapshot();
            state_liveness.reset();
            Ok(())
        });

        let ack_liveness = liveness.clone();
        dispatcher.add_callback(protocol::ADDR_IP_ACK, move |_| {
            ack_liveness.reset();
            debug!("device acknowledged address");
            Ok(())
        });

        dispatcher
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
