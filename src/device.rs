use serde::{ Deserialize, Serialize };
use std::fmt;

/// Interface name the virtual device is registered under.
pub const INTERFACE_NAME: &str = "ESP32";

/// Product string carried in the device descriptor.
pub const PRODUCT_NAME: &str = "Custom";

/// Largest value the device's 12-bit ADC reports for the encoder.
pub const ENCODER_FULL_SCALE: f32 = 4095.0;

// ─────────────────────────────────────────────────────────────────────
//  State snapshot
// ─────────────────────────────────────────────────────────────────────

/// One sample of device state.
///
/// `encoder` is the calibrated value: the offset from the first reading
/// seen after connect, in units of full-scale (so roughly -1.0..1.0).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceState {
    pub button: bool,
    pub encoder: f32,
}

impl DeviceState {
    /// Map the two raw wire fields onto button + normalized encoder.
    ///
    /// Wire polarity is inverted: `0` means the button is held down.
    /// The encoder is left uncalibrated here (in `[0, 1]`).
    #[inline]
    pub fn from_wire(button_raw: i32, encoder_raw: i32) -> Self {
        Self {
            button: button_raw == 0,
            encoder: (encoder_raw as f32) / ENCODER_FULL_SCALE,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "button={} encoder={:+.4}", if self.button { "down" } else { "up" }, self.encoder)
    }
}

// ─────────────────────────────────────────────────────────────────────
//  Descriptor + handle
// ─────────────────────────────────────────────────────────────────────

/// Capabilities advertised to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Button,
    Encoder,
    HapticEvent,
    MotorSpeed,
}

/// Identifying metadata handed to the host when the device is registered.
///
/// The core only builds and passes this through; downstream consumers use
/// it to match devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub interface_name: String,
    pub product: String,
    pub capabilities: Vec<Capability>,
    pub serial: String,
}

impl DeviceDescriptor {
    /// Descriptor for an ESP32 reachable at `client_addr:client_port` and
    /// talking back to us on `server_port`.
    pub fn esp32(client_addr: &str, client_port: u16, server_port: u16) -> Self {
        Self {
            interface_name: INTERFACE_NAME.to_string(),
            product: PRODUCT_NAME.to_string(),
            capabilities: vec![
                Capability::Button,
                Capability::Encoder,
                Capability::HapticEvent,
                Capability::MotorSpeed
            ],
            serial: format!("{client_addr}:{client_port}->{server_port}"),
        }
    }
}

/// Opaque id the host assigns to a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceHandle(pub u32);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────
//  Commands
// ─────────────────────────────────────────────────────────────────────

/// Outbound actuator commands.
///
/// Serialized with an internal `type` tag so the stdio bridge can read
/// lines like `{"type":"motor_speed","speed":0.5}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceCommand {
    /// Fire a predefined haptic pattern on the device.
    HapticEvent {
        event_id: i32,
    },
    /// Realtime motor speed, `0.0..=1.0`.
    MotorSpeed {
        speed: f32,
    },
}

impl DeviceCommand {
    /// Speed zero.
    pub const STOP_MOTOR: DeviceCommand = DeviceCommand::MotorSpeed { speed: 0.0 };

    pub fn kind(&self) -> &'static str {
        match self {
            DeviceCommand::HapticEvent { .. } => "haptic_event",
            DeviceCommand::MotorSpeed { .. } => "motor_speed",
        }
    }
}
