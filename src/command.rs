use crate::device::DeviceCommand;
use crate::error::Result;
use crate::host::CommandSink;
use crate::protocol;
use crate::stats::Stats;
use crate::transport::OscSender;
use std::sync::Arc;
use tracing::debug;

/// Outbound half of a session: encodes device commands and sends them to
/// the ESP32. Fire-and-forget, no acknowledgement or retry.
pub struct CommandChannel {
    sender: Arc<OscSender>,
    stats: Arc<Stats>,
}

impl CommandChannel {
    pub fn new(sender: Arc<OscSender>, stats: Arc<Stats>) -> Self {
        Self { sender, stats }
    }
}

impl CommandSink for CommandChannel {
    fn execute(&self, command: &DeviceCommand) -> Result<()> {
        let msg = protocol::command_message(command);
        debug!(remote = %self.sender.remote(), addr = %msg.addr, args = ?msg.args, "📤 command");
        self.sender.send(msg)?;
        self.stats.record_command();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::test_support::FakeDevice;
    use rosc::OscType;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn channel(device: &FakeDevice) -> (CommandChannel, Arc<OscSender>, Arc<Stats>) {
        let stats = Stats::new();
        let sender = Arc::new(OscSender::bind(device.addr(), stats.clone()).unwrap());
        (CommandChannel::new(sender.clone(), stats.clone()), sender, stats)
    }

    #[test]
    fn test_haptic_event_on_wire() {
        let device = FakeDevice::bind();
        let (ch, _, stats) = channel(&device);
        ch.execute(&(DeviceCommand::HapticEvent { event_id: 42 })).unwrap();

        let msg = device.recv(Duration::from_millis(500)).expect("motor/cmd");
        assert_eq!(msg.addr, protocol::ADDR_MOTOR_CMD);
        assert_eq!(msg.args, vec![OscType::Int(42)]);
        assert_eq!(stats.commands_sent.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_motor_speed_on_wire() {
        let device = FakeDevice::bind();
        let (ch, _, _) = channel(&device);
        ch.execute(&(DeviceCommand::MotorSpeed { speed: 0.73 })).unwrap();
        ch.execute(&DeviceCommand::STOP_MOTOR).unwrap();

        let msgs = device.recv_pending();
        let args: Vec<_> = msgs.iter().map(|m| (m.addr.as_str(), m.args.clone())).collect();
        assert_eq!(
            args,
            vec![
                (protocol::ADDR_MOTOR_RT, vec![OscType::Int(73)]),
                (protocol::ADDR_MOTOR_RT, vec![OscType::Int(0)])
            ]
        );
    }

    #[test]
    fn test_closed_sender_surfaces_transport_error() {
        let device = FakeDevice::bind();
        let (ch, sender, stats) = channel(&device);
        sender.close();
        let err = ch.execute(&(DeviceCommand::HapticEvent { event_id: 1 })).unwrap_err();
        assert!(matches!(err, BridgeError::TransportUnavailable(_)));
        assert_eq!(stats.commands_sent.load(Ordering::Relaxed), 0);
        assert_eq!(stats.send_errors.load(Ordering::Relaxed), 1);
    }
}
