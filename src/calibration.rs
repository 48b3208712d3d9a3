use std::sync::Mutex;

// ─────────────────────────────────────────────────────────────────────
//  Calibration: zero the encoder on the first reading
// ─────────────────────────────────────────────────────────────────────
//
//  The encoder is an absolute sensor whose zero point is arbitrary per
//  boot.  We make the axis relative-to-power-on:
//
//      first reading after connect  →  zero_value = raw,  output 0
//      every later reading          →  output raw − zero_value
//
//  This discards the sensor's absolute range.  The filter lives inside
//  the session's connection state, so a reconnect starts from scratch.

/// Zero-point state exposed for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Calibration {
    pub zero_value: f32,
    pub is_set: bool,
}

/// Single-axis zeroing filter.
#[derive(Debug, Default)]
pub struct CalibrationFilter {
    state: Calibration,
}

impl CalibrationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw encoder value, get the calibrated value back.
    #[inline]
    pub fn apply(&mut self, raw: f32) -> f32 {
        if !self.state.is_set {
            self.state = Calibration { zero_value: raw, is_set: true };
        }
        raw - self.state.zero_value
    }

    pub fn calibration(&self) -> Calibration {
        self.state
    }
}

/// Thread-safe wrapper so the receive task can calibrate while the
/// consumer inspects the zero point.
#[derive(Debug, Default)]
pub struct SharedCalibration {
    inner: Mutex<CalibrationFilter>,
}

impl SharedCalibration {
    pub fn new() -> Self {
        Self { inner: Mutex::new(CalibrationFilter::new()) }
    }

    pub fn apply(&self, raw: f32) -> f32 {
        let mut filter = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        filter.apply(raw)
    }

    pub fn calibration(&self) -> Calibration {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .calibration()
    }
}

// ─────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────
