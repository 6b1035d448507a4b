use vc_signal::{db_to_amplitude, RingBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Below threshold: keep estimator state warm but emit silence.
    Silent,
    Active,
}

/// Loudness gate over the volume window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeGate {
    threshold_db: f32,
    threshold: f32,
}

impl VolumeGate {
    pub fn new(threshold_db: f32) -> Self {
        Self {
            threshold_db,
            threshold: db_to_amplitude(threshold_db),
        }
    }

    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }

    /// Linear RMS the window has to reach.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn measure(&self, window: &RingBuffer) -> f32 {
        window.mean_square().max(0.0).sqrt()
    }

    pub fn decide(&self, rms: f32) -> GateDecision {
        if rms < self.threshold {
            GateDecision::Silent
        } else {
            GateDecision::Active
        }
    }
}
