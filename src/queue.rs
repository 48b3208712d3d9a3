use crate::device::DeviceState;
use std::collections::VecDeque;
use std::sync::Mutex;

/// FIFO between the receive task (producer) and the tick (consumer).
///
/// One mutex guards both ends. The lock is held for a single push or a
/// single swap of the whole buffer, never across I/O. There is no depth
/// limit: if the consumer stalls, the queue grows.
#[derive(Debug, Default)]
pub struct StateQueue {
    items: Mutex<VecDeque<DeviceState>>,
}

impl StateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn enqueue(&self, state: DeviceState) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.push_back(state);
    }

    /// Remove and return everything queued, oldest first.
    pub fn drain(&self) -> VecDeque<DeviceState> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *items)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
