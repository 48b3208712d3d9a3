//! Loopback helpers shared by the unit tests.

use crate::protocol;
use rosc::{ OscMessage, OscPacket, OscType };
use std::net::{ SocketAddr, UdpSocket };
use std::ops::Range;
use std::time::Duration;

/// Hold `n` consecutive loopback UDP ports. Returns the first port and the
/// sockets keeping them busy.
pub fn reserve_port_run(n: usize) -> (u16, Vec<UdpSocket>) {
    for _ in 0..64 {
        let first = UdpSocket::bind("127.0.0.1:0").unwrap();
        let base = first.local_addr().unwrap().port();
        if (base as usize) + n > (u16::MAX as usize) {
            continue;
        }
        let mut held = vec![first];
        for i in 1..n {
            match UdpSocket::bind(("127.0.0.1", base + (i as u16))) {
                Ok(s) => held.push(s),
                Err(_) => break,
            }
        }
        if held.len() == n {
            return (base, held);
        }
    }
    panic!("could not reserve {n} consecutive UDP ports");
}

/// A run of `n` ports that were free a moment ago.
pub fn free_port_range(n: usize) -> Range<u16> {
    let (base, held) = reserve_port_run(n);
    drop(held);
    base..base + (n as u16)
}

/// Stands in for the ESP32: a plain blocking socket on loopback.
pub struct FakeDevice {
    socket: UdpSocket,
}

impl FakeDevice {
    pub fn bind() -> Self {
        Self { socket: UdpSocket::bind("127.0.0.1:0").unwrap() }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    pub fn send_raw(&self, port: u16, bytes: &[u8]) {
        self.socket.send_to(bytes, ("127.0.0.1", port)).unwrap();
    }

    pub fn send(&self, port: u16, addr: &str, args: Vec<OscType>) {
        let msg = OscMessage { addr: addr.to_string(), args };
        self.send_raw(port, &protocol::encode(msg).unwrap());
    }

    pub fn send_state(&self, port: u16, button_raw: i32, encoder_raw: i32) {
        self.send(port, protocol::ADDR_STATE, vec![OscType::Int(button_raw), OscType::Int(encoder_raw)]);
    }

    pub fn send_ack(&self, port: u16) {
        self.send(port, protocol::ADDR_IP_ACK, vec![]);
    }

    /// Next message, or `None` if nothing arrives within `timeout`.
    pub fn recv(&self, timeout: Duration) -> Option<OscMessage> {
        self.socket.set_read_timeout(Some(timeout)).unwrap();
        let mut buf = [0u8; protocol::MAX_DATAGRAM_SIZE];
        let len = self.socket.recv(&mut buf).ok()?;
        match rosc::decoder::decode_udp(&buf[..len]).ok()?.1 {
            OscPacket::Message(msg) => Some(msg),
            OscPacket::Bundle(_) => None,
        }
    }

    /// Everything that is already waiting.
    pub fn recv_pending(&self) -> Vec<OscMessage> {
        let mut out = Vec::new();
        while let Some(msg) = self.recv(Duration::from_millis(50)) {
            out.push(msg);
        }
        out
    }
}
