//! Evaporation laws for task intensity and the inhibition field.

use serde::{Deserialize, Serialize};

/// Decay law applied to task intensity each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayKind {
    Exponential,
    Linear,
}

fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Apply one tick of the configured decay law to a task intensity.
///
/// Exponential: `v * e^(-rate)`. Linear: `max(0, v - rate)`. The result is
/// clamped to [0.0, 1.0]; a fully decayed entry is extinguished, not deleted.
pub fn decay_intensity(value: f64, kind: DecayKind, rate: f64) -> f64 {
    let current = clamp_unit(value);
    match kind {
        DecayKind::Exponential => clamp_unit(current * (-rate).exp()),
        DecayKind::Linear => clamp_unit(current - rate),
    }
}

/// Apply one tick of exponential decay to the inhibition field γ.
pub fn decay_inhibition(value: f64, rate: f64) -> f64 {
    clamp_unit(clamp_unit(value) * (-rate).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_decay_matches_closed_form() {
        let mut value = 1.0;
        for _ in 0..10 {
            value = decay_intensity(value, DecayKind::Exponential, 0.05);
        }
        let expected = (-0.05_f64 * 10.0).exp();
        assert!((value - expected).abs() < 1e-12, "{value} vs {expected}");
    }

    #[test]
    fn linear_decay_floors_at_zero() {
        assert_eq!(decay_intensity(0.08, DecayKind::Linear, 0.05), 0.03);
        assert_eq!(decay_intensity(0.03, DecayKind::Linear, 0.05), 0.0);
    }

    #[test]
    fn inhibition_crosses_resume_threshold_near_twenty_ticks() {
        // Calibration: 0.5 decays below 0.1 in ceil(ln(5)/0.08) = 21 ticks,
        // fitting inside the 50-tick default horizon.
        let mut gamma = 0.5;
        let mut ticks = 0;
        while gamma >= 0.1 {
            gamma = decay_inhibition(gamma, 0.08);
            ticks += 1;
        }
        assert_eq!(ticks, 21);
    }

    #[test]
    fn decay_clamps_out_of_range_inputs() {
        assert_eq!(decay_intensity(1.7, DecayKind::Linear, 0.0), 1.0);
        assert_eq!(decay_inhibition(-0.3, 0.08), 0.0);
    }
}
