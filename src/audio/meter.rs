use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) const METER_FLOOR_DB: f32 = -60.0;

/// Lock-free input level shared between the capture stage and the UI.
#[derive(Clone, Debug)]
pub struct LiveMeter {
    level_bits: Arc<AtomicU32>,
    frames: Arc<AtomicU64>,
}

impl LiveMeter {
    pub fn new() -> Self {
        Self {
            level_bits: Arc::new(AtomicU32::new(METER_FLOOR_DB.to_bits())),
            frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record the RMS level of one frame.
    pub fn record(&self, samples: &[f32]) {
        self.set_db(rms_db(samples));
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_db(&self, db: f32) {
        self.level_bits.store(db.to_bits(), Ordering::Relaxed);
    }

    pub fn level_db(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }

    /// Frames metered since creation.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.set_db(METER_FLOOR_DB);
    }
}

impl Default for LiveMeter {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn rms_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return METER_FLOOR_DB;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    let rms = energy.sqrt().max(1e-6);
    20.0 * rms.log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_meter_defaults_to_floor() {
        let meter = LiveMeter::new();
        assert_eq!(meter.level_db(), METER_FLOOR_DB);
        assert_eq!(meter.frames(), 0);
    }

    #[test]
    fn record_tracks_level_and_count() {
        let meter = LiveMeter::new();
        meter.record(&[0.5; 64]);
        assert!((meter.level_db() - (-6.02)).abs() < 0.1);
        assert_eq!(meter.frames(), 1);
        meter.reset();
        assert_eq!(meter.level_db(), METER_FLOOR_DB);
    }

    #[test]
    fn rms_db_handles_empty() {
        assert_eq!(rms_db(&[]), METER_FLOOR_DB);
    }
}
