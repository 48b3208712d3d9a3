use crate::error::{ BridgeError, Result };
use crate::protocol::{ self, MAX_DATAGRAM_SIZE };
use crate::stats::Stats;
use rosc::OscMessage;
use std::io;
use std::net::{ IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr };
use std::ops::Range;
use std::sync::{ Arc, Mutex };
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{ debug, info, warn };

/// Callback invoked for every inbound message on a registered address.
pub type Handler = Box<dyn Fn(&OscMessage) -> Result<()> + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════
//  Address dispatch
// ═══════════════════════════════════════════════════════════════════════

/// Routes inbound messages to handlers by OSC address.
#[derive(Default)]
pub struct Dispatcher {
    routes: Vec<(String, Handler)>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_callback<F>(&mut self, addr: &str, handler: F)
        where F: Fn(&OscMessage) -> Result<()> + Send + Sync + 'static
    {
        self.routes.push((addr.to_string(), Box::new(handler)));
    }

    /// Run the handler registered for `msg.addr`. Returns `None` when no
    /// route matches.
    pub fn dispatch(&self, msg: &OscMessage) -> Option<Result<()>> {
        self.routes
            .iter()
            .find(|(route, _)| protocol::address_matches(route, &msg.addr))
            .map(|(_, handler)| handler(msg))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Inbound listener
// ═══════════════════════════════════════════════════════════════════════

/// Receive task bound to one server port.
///
/// Dropping the listener aborts the task; [`OscListener::shutdown`] also
/// waits for it so the port is free when it returns.
pub struct OscListener {
    port: u16,
    task: Option<JoinHandle<()>>,
}

impl OscListener {
    /// Start receiving on `socket`. Must be called inside a tokio runtime.
    pub fn spawn(
        socket: std::net::UdpSocket,
        dispatcher: Dispatcher,
        stats: Arc<Stats>
    ) -> io::Result<Self> {
        let port = socket.local_addr()?.port();
        let socket = UdpSocket::from_std(socket)?;
        let task = tokio::spawn(async move {
            recv_loop(port, socket, dispatcher, stats).await;
        });
        Ok(Self { port, task: Some(task) })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop the receive task and release the socket.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // Cancelled is the expected outcome; the socket is dropped with the task.
            let _ = task.await;
            debug!(port = self.port, "listener stopped");
        }
    }
}

impl Drop for OscListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn recv_loop(port: u16, socket: UdpSocket, dispatcher: Dispatcher, stats: Arc<Stats>) {
    debug!(port, "OSC listener started");

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut messages = Vec::new();

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(port, error = %e, "UDP recv error");
                continue;
            }
        };

        stats.record_recv(len);

        let packet = match rosc::decoder::decode_udp(&buf[..len]) {
            Ok((_, packet)) => packet,
            Err(e) => {
                stats.record_malformed();
                debug!(src = %src, error = ?e, "undecodable OSC packet dropped");
                continue;
            }
        };

        messages.clear();
        protocol::flatten(packet, &mut messages);

        // Each message is handled on its own; a bad one never blocks the rest.
        for msg in &messages {
            match dispatcher.dispatch(msg) {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    stats.record_malformed();
                    warn!(src = %src, addr = %msg.addr, error = %e, "message dropped");
                }
                None => {
                    debug!(src = %src, addr = %msg.addr, "no handler for address");
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Outbound sender
// ═══════════════════════════════════════════════════════════════════════

/// Fire-and-forget OSC sender aimed at one remote endpoint.
///
/// Sends are non-blocking. A full socket buffer drops the datagram with a
/// warning; any other error surfaces as [`BridgeError::TransportUnavailable`].
pub struct OscSender {
    remote: SocketAddr,
    socket: Mutex<Option<std::net::UdpSocket>>,
    stats: Arc<Stats>,
}

impl OscSender {
    pub fn bind(remote: SocketAddr, stats: Arc<Stats>) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(SocketAddr::new(unspecified_for(&remote), 0))?;
        socket.set_nonblocking(true)?;
        Ok(Self { remote, socket: Mutex::new(Some(socket)), stats })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn send(&self, msg: OscMessage) -> Result<()> {
        let addr = msg.addr.clone();
        let buf = protocol::encode(msg)?;

        let guard = self.socket.lock().unwrap_or_else(|e| e.into_inner());
        let Some(socket) = guard.as_ref() else {
            self.stats.record_send_error();
            return Err(
                BridgeError::TransportUnavailable(
                    io::Error::new(io::ErrorKind::NotConnected, "sender closed")
                )
            );
        };

        match socket.send_to(&buf, self.remote) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.stats.record_send_error();
                warn!(remote = %self.remote, addr = %addr, "send buffer full — datagram dropped");
                Ok(())
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(BridgeError::TransportUnavailable(e))
            }
        }
    }

    /// Release the socket. Later sends fail with `TransportUnavailable`.
    pub fn close(&self) {
        let mut guard = self.socket.lock().unwrap_or_else(|e| e.into_inner());
        guard.take();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.socket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Socket helpers
// ═══════════════════════════════════════════════════════════════════════

/// Bind a non-blocking UDP socket for the listener.
///
/// No `SO_REUSEPORT`: a port already in use must fail to bind.
pub fn bind_udp(addr: SocketAddr, recv_buf_size: usize) -> io::Result<std::net::UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP)
    )?;

    socket.set_nonblocking(true)?;
    if recv_buf_size > 0 {
        socket.set_recv_buffer_size(recv_buf_size)?;
    }
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

/// Bind the first free port in `ports` (end exclusive) on `host`.
pub fn bind_in_range(
    host: IpAddr,
    ports: Range<u16>,
    recv_buf_size: usize
) -> Result<(std::net::UdpSocket, u16)> {
    for port in ports.clone() {
        // Port 0 would hand back an ephemeral port outside the range.
        if port == 0 {
            continue;
        }
        match bind_udp(SocketAddr::new(host, port), recv_buf_size) {
            Ok(socket) => {
                info!(host = %host, port, "✅ server port bound");
                return Ok((socket, port));
            }
            Err(e) => {
                debug!(host = %host, port, error = %e, "server port unavailable, trying next");
            }
        }
    }
    Err(BridgeError::PortExhausted { range: ports })
}

/// Resolve the client endpoint, preferring IPv4. Hostnames are looked up
/// on tokio's blocking pool.
pub async fn resolve_remote(addr: &str, port: u16) -> Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = tokio::net
        ::lookup_host((addr, port)).await
        .map_err(|e| {
            debug!(addr, port, error = %e, "client lookup failed");
            BridgeError::InvalidAddress(format!("{addr}:{port}"))
        })?
        .collect();
    candidates
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| BridgeError::InvalidAddress(format!("{addr}:{port}")))
}

/// Best guess at the local address the remote can reach us on: the
/// source address the OS routes `remote` through. Nothing is sent.
pub fn resolve_local_address(remote: SocketAddr) -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind(SocketAddr::new(unspecified_for(&remote), 0))?;
        socket.connect(remote)?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(ip) => {
            warn!(remote = %remote, "no routable local address found");
            ip
        }
        Err(e) => {
            warn!(remote = %remote, error = %e, "local address lookup failed");
            unspecified_for(&remote)
        }
    }
}

fn unspecified_for(remote: &SocketAddr) -> IpAddr {
    match remote {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
