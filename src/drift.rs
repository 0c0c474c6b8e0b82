use crate::config::DriftSettings;
use std::time::Duration;

pub const MIN_AUTO_POWER: f64 = 1.2;
pub const MAX_AUTO_POWER: f64 = 2.6;

/// Maps playback time onto caption time, pulling captions forward as the
/// track progresses.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftModel {
    pub target_end_drift_secs: f64,
    pub duration_basis_secs: Option<f64>,
    pub correction_power: f64,
    pub linear_ratio: Option<f64>,
}

impl Default for DriftModel {
    fn default() -> Self {
        Self {
            target_end_drift_secs: 0.0,
            duration_basis_secs: None,
            correction_power: MAX_AUTO_POWER,
            linear_ratio: None,
        }
    }
}

/// Shorter tracks get a steeper curve so little correction happens early on.
pub fn auto_power(duration_secs: f64) -> f64 {
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return MAX_AUTO_POWER;
    }
    (1.2 + 120.0 / duration_secs).clamp(MIN_AUTO_POWER, MAX_AUTO_POWER)
}

impl DriftModel {
    pub fn for_track(duration_secs: Option<f64>, settings: &DriftSettings) -> Self {
        let basis = duration_secs.filter(|d| d.is_finite() && *d > 0.0);
        let correction_power = settings
            .correction_power
            .filter(|p| p.is_finite() && *p > 0.0)
            .unwrap_or_else(|| basis.map(auto_power).unwrap_or(MAX_AUTO_POWER));
        let target = if settings.target_end_drift_secs.is_finite() {
            settings.target_end_drift_secs
        } else {
            0.0
        };
        Self {
            target_end_drift_secs: target,
            duration_basis_secs: basis,
            correction_power,
            linear_ratio: settings
                .linear_ratio
                .filter(|r| r.is_finite())
                .map(|r| r.max(0.0)),
        }
    }

    /// Caption-clock seconds for `base_elapsed` seconds of playback. An explicit
    /// linear ratio always wins over the curve.
    pub fn corrected(&self, base_elapsed: f64) -> f64 {
        if let Some(ratio) = self.linear_ratio {
            return base_elapsed * (1.0 + ratio);
        }
        match self.duration_basis_secs {
            Some(basis) if self.target_end_drift_secs != 0.0 => {
                let x = (base_elapsed / basis).clamp(0.0, 1.0);
                base_elapsed + self.target_end_drift_secs * x.powf(self.correction_power)
            }
            _ => base_elapsed,
        }
    }
}

const MIN_REPORTED_DELAY_MS: f64 = 50.0;
const DELAY_GAIN: f64 = 0.8;
const MAX_LEAD_SECS: f64 = 2.0;
const DECAY_AFTER: Duration = Duration::from_secs(2);
const DECAY_TAU_SECS: f64 = 10.0;

/// Accumulates audio-start stalls reported by the playback sink.
///
/// The lead is subtracted from the raw clock. It decays back toward zero once
/// reports stop arriving.
#[derive(Debug, Clone, Default)]
pub struct DelayCompensator {
    lead_secs: f64,
    last_update: Option<Duration>,
}

impl DelayCompensator {
    pub fn report(&mut self, millis: f64, now: Duration) {
        if !millis.is_finite() || millis <= MIN_REPORTED_DELAY_MS {
            return;
        }
        let current = self.current_lead(now);
        self.lead_secs = (current + DELAY_GAIN * millis / 1000.0).min(MAX_LEAD_SECS);
        self.last_update = Some(now);
    }

    pub fn current_lead(&self, now: Duration) -> f64 {
        let Some(last) = self.last_update else {
            return self.lead_secs;
        };
        let idle = now.saturating_sub(last);
        if idle <= DECAY_AFTER {
            return self.lead_secs;
        }
        let decaying = (idle - DECAY_AFTER).as_secs_f64();
        self.lead_secs * (-decaying / DECAY_TAU_SECS).exp()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
