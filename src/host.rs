//! Boundary to the host's input-device layer.
//!
//! The session only needs five operations from the host: register and
//! unregister a virtual device, push a state event to it, and attach or
//! detach the sink that receives that device's outbound commands. Commands
//! are routed by handle to the owning session's sink; there is no global
//! broadcast.

use crate::device::{ DeviceCommand, DeviceDescriptor, DeviceHandle, DeviceState };
use crate::error::{ BridgeError, Result };
use std::collections::{ HashMap, VecDeque };
use std::sync::atomic::{ AtomicU32, Ordering };
use std::sync::{ Arc, Mutex };
use tracing::{ debug, info, warn };

/// Receives the commands issued to one registered device.
pub trait CommandSink: Send + Sync {
    fn execute(&self, command: &DeviceCommand) -> Result<()>;
}

/// What the session needs from the host's input system.
pub trait InputHost: Send + Sync {
    fn register(&self, descriptor: DeviceDescriptor) -> Result<DeviceHandle>;
    fn unregister(&self, handle: DeviceHandle) -> Result<()>;
    fn push_state(&self, handle: DeviceHandle, state: DeviceState);
    fn subscribe_commands(&self, handle: DeviceHandle, sink: Arc<dyn CommandSink>) -> Result<()>;
    fn unsubscribe_commands(&self, handle: DeviceHandle) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────
//  In-process host
// ─────────────────────────────────────────────────────────────────────

/// Per-device event buffer cap; the oldest event is dropped beyond it.
pub const MAX_PENDING_EVENTS: usize = 1024;

struct DeviceSlot {
    descriptor: DeviceDescriptor,
    events: VecDeque<DeviceState>,
    /// Events lost to the cap since the last drain.
    dropped: u64,
    sink: Option<Arc<dyn CommandSink>>,
}

/// Minimal in-process [`InputHost`]: keeps a per-device event queue for
/// the application to poll and routes commands to the subscribed sink.
#[derive(Default)]
pub struct VirtualInputHost {
    next_id: AtomicU32,
    devices: Mutex<HashMap<DeviceHandle, DeviceSlot>>,
}

impl VirtualInputHost {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn device_count(&self) -> usize {
        self.lock().len()
    }

    pub fn descriptor(&self, handle: DeviceHandle) -> Option<DeviceDescriptor> {
        self.lock()
            .get(&handle)
            .map(|slot| slot.descriptor.clone())
    }

    /// Take the state events queued for `handle`, oldest first.
    pub fn drain_events(&self, handle: DeviceHandle) -> Vec<DeviceState> {
        let mut devices = self.lock();
        let Some(slot) = devices.get_mut(&handle) else {
            return Vec::new();
        };
        if slot.dropped > 0 {
            warn!(device = %handle, dropped = slot.dropped, "state events lost before drain");
            slot.dropped = 0;
        }
        slot.events.drain(..).collect()
    }

    /// Route `command` to the sink subscribed for `handle`.
    ///
    /// Returns `Ok(false)` when the handle is unknown or has no sink; such
    /// commands are ignored rather than treated as errors.
    pub fn execute_command(&self, handle: DeviceHandle, command: DeviceCommand) -> Result<bool> {
        let sink = self.lock()
            .get(&handle)
            .and_then(|slot| slot.sink.clone());
        match sink {
            Some(sink) => {
                sink.execute(&command)?;
                Ok(true)
            }
            None => {
                debug!(device = %handle, kind = command.kind(), "command for unrouted device ignored");
                Ok(false)
            }
        }
    }

    pub fn send_haptic_event(&self, handle: DeviceHandle, event_id: i32) -> Result<bool> {
        self.execute_command(handle, DeviceCommand::HapticEvent { event_id })
    }

    pub fn send_motor_speed(&self, handle: DeviceHandle, speed: f32) -> Result<bool> {
        self.execute_command(handle, DeviceCommand::MotorSpeed { speed })
    }

    pub fn stop_motor(&self, handle: DeviceHandle) -> Result<bool> {
        self.execute_command(handle, DeviceCommand::STOP_MOTOR)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceHandle, DeviceSlot>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl InputHost for VirtualInputHost {
    fn register(&self, descriptor: DeviceDescriptor) -> Result<DeviceHandle> {
        let handle = DeviceHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(device = %handle, serial = %descriptor.serial, "🎛️  device registered");
        self.lock().insert(handle, DeviceSlot {
            descriptor,
            events: VecDeque::new(),
            dropped: 0,
            sink: None,
        });
        Ok(handle)
    }

    fn unregister(&self, handle: DeviceHandle) -> Result<()> {
        match self.lock().remove(&handle) {
            Some(_) => {
                info!(device = %handle, "device removed");
                Ok(())
            }
            None => Err(BridgeError::UnknownDevice(handle)),
        }
    }

    fn push_state(&self, handle: DeviceHandle, state: DeviceState) {
        let mut devices = self.lock();
        let Some(slot) = devices.get_mut(&handle) else {
            warn!(device = %handle, "state for unknown device dropped");
            return;
        };
        if slot.events.len() >= MAX_PENDING_EVENTS {
            slot.events.pop_front();
            if slot.dropped == 0 {
                warn!(device = %handle, cap = MAX_PENDING_EVENTS, "event buffer full, dropping oldest");
            }
            slot.dropped += 1;
        }
        slot.events.push_back(state);
    }

    fn subscribe_commands(&self, handle: DeviceHandle, sink: Arc<dyn CommandSink>) -> Result<()> {
        let mut devices = self.lock();
        let slot = devices.get_mut(&handle).ok_or(BridgeError::UnknownDevice(handle))?;
        slot.sink = Some(sink);
        Ok(())
    }

    fn unsubscribe_commands(&self, handle: DeviceHandle) -> Result<()> {
        let mut devices = self.lock();
        let slot = devices.get_mut(&handle).ok_or(BridgeError::UnknownDevice(handle))?;
        slot.sink = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<DeviceCommand>>,
    }

    impl CommandSink for RecordingSink {
        fn execute(&self, command: &DeviceCommand) -> Result<()> {
            self.seen.lock().unwrap().push(*command);
            Ok(())
        }
    }

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor::esp32("10.0.0.2", 9999, 8888)
    }

    #[test]
    fn test_register_assigns_distinct_handles() {
        let host = VirtualInputHost::new();
        let a = host.register(descriptor()).unwrap();
        let b = host.register(descriptor()).unwrap();
        assert_ne!(a, b);
        assert_eq!(host.device_count(), 2);
        assert_eq!(host.descriptor(b).map(|d| d.serial), Some("10.0.0.2:9999->8888".to_string()));

        host.unregister(a).unwrap();
        assert_eq!(host.device_count(), 1);
        assert!(matches!(host.unregister(a), Err(BridgeError::UnknownDevice(_))));
    }

    #[test]
    fn test_push_state_queues_in_order() {
        let host = VirtualInputHost::new();
        let h = host.register(descriptor()).unwrap();
        for i in 0..3 {
            host.push_state(h, DeviceState { button: false, encoder: i as f32 });
        }
        let events: Vec<f32> = host.drain_events(h).into_iter().map(|s| s.encoder).collect();
        assert_eq!(events, vec![0.0, 1.0, 2.0]);
        assert!(host.drain_events(h).is_empty());
        assert!(host.drain_events(DeviceHandle(999)).is_empty());
    }

    #[test]
    fn test_event_buffer_is_capped() {
        let host = VirtualInputHost::new();
        let h = host.register(descriptor()).unwrap();
        for i in 0..MAX_PENDING_EVENTS + 5 {
            host.push_state(h, DeviceState { button: false, encoder: i as f32 });
        }
        assert_eq!(host.lock()[&h].dropped, 5);

        let events = host.drain_events(h);
        assert_eq!(events.len(), MAX_PENDING_EVENTS);
        assert_eq!(events[0].encoder, 5.0);
        // Draining clears the loss count so the next overflow is reported again.
        assert_eq!(host.lock()[&h].dropped, 0);

        host.push_state(h, DeviceState { button: true, encoder: 0.0 });
        assert_eq!(host.lock()[&h].dropped, 0);
    }

    #[test]
    fn test_commands_route_to_owning_sink_only() {
        let host = VirtualInputHost::new();
        let mine = host.register(descriptor()).unwrap();
        let other = host.register(descriptor()).unwrap();
        let sink = Arc::new(RecordingSink::default());
        host.subscribe_commands(mine, sink.clone()).unwrap();

        assert!(host.send_haptic_event(mine, 3).unwrap());
        assert!(host.stop_motor(mine).unwrap());
        assert!(!host.send_motor_speed(other, 0.5).unwrap());
        assert!(!host.send_motor_speed(DeviceHandle(999), 0.5).unwrap());

        assert_eq!(
            *sink.seen.lock().unwrap(),
            vec![DeviceCommand::HapticEvent { event_id: 3 }, DeviceCommand::STOP_MOTOR]
        );

        host.unsubscribe_commands(mine).unwrap();
        assert!(!host.send_haptic_event(mine, 4).unwrap());
    }
}
