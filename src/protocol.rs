//! ESP32 ↔ Host OSC protocol
//!
//! All traffic is plain OSC over UDP. The device speaks to us on the
//! `/unity/...` addresses and listens on `/arduino/...`:
//! ```text
//! ┌──────────────────────┬───────────┬───────────────────────────────┐
//! │ Address              │ Direction │ Arguments                      │
//! ├──────────────────────┼───────────┼───────────────────────────────┤
//! │ /unity/state/        │ ESP → us  │ button:int  encoder:int(12bit) │
//! │ /unity/ipupdated/    │ ESP → us  │ (none)                         │
//! │ /arduino/updateip    │ us → ESP  │ "<ip>:<port>":string           │
//! │ /arduino/motor/cmd   │ us → ESP  │ event_id:int                   │
//! │ /arduino/motor/rt    │ us → ESP  │ speed_percent:int (0–100)      │
//! └──────────────────────┴───────────┴───────────────────────────────┘
//! ```

use crate::device::{ DeviceCommand, DeviceState };
use crate::error::{ BridgeError, Result };
use rosc::{ OscMessage, OscPacket, OscType };
use std::net::IpAddr;

// ═══════════════════════════════════════════════════════════════════════
//  Addresses
// ═══════════════════════════════════════════════════════════════════════

/// ESP → us: button + encoder sample.
pub const ADDR_STATE: &str = "/unity/state/";
/// ESP → us: the device picked up our announced address.
pub const ADDR_IP_ACK: &str = "/unity/ipupdated/";
/// us → ESP: where to send state to.
pub const ADDR_UPDATE_IP: &str = "/arduino/updateip";
/// us → ESP: discrete haptic event.
pub const ADDR_MOTOR_CMD: &str = "/arduino/motor/cmd";
/// us → ESP: realtime motor speed.
pub const ADDR_MOTOR_RT: &str = "/arduino/motor/rt";

/// Largest datagram we expect from the device.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// `true` when `addr` names the same OSC address as `route`, ignoring a
/// trailing `/` on either side (the firmware is inconsistent about it).
#[inline]
pub fn address_matches(route: &str, addr: &str) -> bool {
    route.trim_end_matches('/') == addr.trim_end_matches('/')
}

// ═══════════════════════════════════════════════════════════════════════
//  Inbound
// ═══════════════════════════════════════════════════════════════════════

/// Read positional argument `idx` as an int. Floats are truncated so firmware
/// builds that send `f` tags still decode.
pub fn int_arg(msg: &OscMessage, idx: usize) -> Result<i32> {
    match msg.args.get(idx) {
        Some(OscType::Int(v)) => Ok(*v),
        Some(OscType::Float(v)) => Ok(*v as i32),
        Some(OscType::Long(v)) => Ok(*v as i32),
        Some(OscType::Double(v)) => Ok(*v as i32),
        Some(other) =>
            Err(BridgeError::MalformedMessage {
                addr: msg.addr.clone(),
                reason: format!("argument {idx} is not numeric: {other:?}"),
            }),
        None =>
            Err(BridgeError::MalformedMessage {
                addr: msg.addr.clone(),
                reason: format!("missing argument {idx} (got {})", msg.args.len()),
            }),
    }
}

/// Decode a `/unity/state/` message into an uncalibrated [`DeviceState`].
pub fn decode_state(msg: &OscMessage) -> Result<DeviceState> {
    let button_raw = int_arg(msg, 0)?;
    let encoder_raw = int_arg(msg, 1)?;
    Ok(DeviceState::from_wire(button_raw, encoder_raw))
}

/// Flatten a packet into its messages, unpacking bundles recursively.
pub fn flatten(packet: OscPacket, out: &mut Vec<OscMessage>) {
    match packet {
        OscPacket::Message(msg) => out.push(msg),
        OscPacket::Bundle(bundle) => {
            for p in bundle.content {
                flatten(p, out);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Outbound
// ═══════════════════════════════════════════════════════════════════════

/// `/arduino/updateip "<ip>:<port>"`
pub fn announce_message(local: IpAddr, server_port: u16) -> OscMessage {
    OscMessage {
        addr: ADDR_UPDATE_IP.to_string(),
        args: vec![OscType::String(format!("{local}:{server_port}"))],
    }
}

/// Motor speed as a 0–100 percentage, rounded half-to-even.
#[inline]
pub fn speed_percent(speed: f32) -> i32 {
    (speed * 100.0).round_ties_even() as i32
}

/// Wire form of a [`DeviceCommand`].
pub fn command_message(cmd: &DeviceCommand) -> OscMessage {
    match *cmd {
        DeviceCommand::HapticEvent { event_id } =>
            OscMessage {
                addr: ADDR_MOTOR_CMD.to_string(),
                args: vec![OscType::Int(event_id)],
            },
        DeviceCommand::MotorSpeed { speed } =>
            OscMessage {
                addr: ADDR_MOTOR_RT.to_string(),
                args: vec![OscType::Int(speed_percent(speed))],
            },
    }
}

/// Encode a single message into a UDP payload.
pub fn encode(msg: OscMessage) -> Result<Vec<u8>> {
    Ok(rosc::encoder::encode(&OscPacket::Message(msg))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rosc::{ OscBundle, OscTime };

    fn state_msg(args: Vec<OscType>) -> OscMessage {
        OscMessage { addr: ADDR_STATE.to_string(), args }
    }

    #[test]
    fn test_address_trailing_slash() {
        assert!(address_matches(ADDR_STATE, "/unity/state"));
        assert!(address_matches(ADDR_STATE, "/unity/state/"));
        assert!(!address_matches(ADDR_STATE, "/unity/states"));
    }

    #[test]
    fn test_decode_state_polarity() {
        let pressed = decode_state(&state_msg(vec![OscType::Int(0), OscType::Int(4095)])).unwrap();
        assert!(pressed.button);
        assert!((pressed.encoder - 1.0).abs() < 1e-6);

        let released = decode_state(&state_msg(vec![OscType::Int(1), OscType::Int(0)])).unwrap();
        assert!(!released.button);
    }

    #[test]
    fn test_decode_state_accepts_floats() {
        let s = decode_state(&state_msg(vec![OscType::Float(1.0), OscType::Float(2047.9)])).unwrap();
        assert!(!s.button);
        assert!((s.encoder - 2047.0 / 4095.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_state_missing_field() {
        let err = decode_state(&state_msg(vec![OscType::Int(0)])).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedMessage { .. }), "{err}");

        let err = decode_state(
            &state_msg(vec![OscType::Int(0), OscType::String("x".into())])
        ).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedMessage { .. }), "{err}");
    }

    #[test]
    fn test_command_encoding() {
        let haptic = command_message(&(DeviceCommand::HapticEvent { event_id: 42 }));
        assert_eq!(haptic.addr, ADDR_MOTOR_CMD);
        assert_eq!(haptic.args, vec![OscType::Int(42)]);

        let rt = command_message(&(DeviceCommand::MotorSpeed { speed: 0.73 }));
        assert_eq!(rt.addr, ADDR_MOTOR_RT);
        assert_eq!(rt.args, vec![OscType::Int(73)]);
    }

    #[test]
    fn test_speed_percent_bounds() {
        assert_eq!(speed_percent(0.0), 0);
        assert_eq!(speed_percent(1.0), 100);
        assert_eq!(speed_percent(0.125), 12);
    }

    #[test]
    fn test_announce_payload() {
        let msg = announce_message("10.0.0.7".parse().unwrap(), 8889);
        assert_eq!(msg.addr, ADDR_UPDATE_IP);
        assert_eq!(msg.args, vec![OscType::String("10.0.0.7:8889".into())]);
    }

    #[test]
    fn test_flatten_nested_bundle() {
        let inner = OscPacket::Bundle(OscBundle {
            timetag: OscTime { seconds: 0, fractional: 1 },
            content: vec![OscPacket::Message(state_msg(vec![OscType::Int(1), OscType::Int(1)]))],
        });
        let outer = OscPacket::Bundle(OscBundle {
            timetag: OscTime { seconds: 0, fractional: 1 },
            content: vec![OscPacket::Message(state_msg(vec![])), inner],
        });
        let mut out = Vec::new();
        flatten(outer, &mut out);
        assert_eq!(out.len(), 2);
        assert!(out[0].args.is_empty());
        assert_eq!(out[1].args.len(), 2);
    }
}
