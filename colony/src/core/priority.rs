//! Deterministic scoring for Discover intensities and Transform selection.

use rand::Rng;

/// Min-max normalize a batch of raw scores into `[floor, ceiling]`.
///
/// A degenerate batch (all scores equal) maps every entry to 0.5 so a uniform
/// repository still yields usable priorities.
pub fn normalize_batch(raw_scores: &[f64], floor: f64, ceiling: f64) -> Vec<f64> {
    if raw_scores.is_empty() {
        return Vec::new();
    }
    let min = raw_scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = raw_scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    raw_scores
        .iter()
        .map(|&score| {
            if max == min {
                0.5
            } else {
                let normalized = (score - min) / (max - min);
                normalized.clamp(0.0, 1.0) * (ceiling - floor) + floor
            }
        })
        .map(|value| value.clamp(floor, ceiling))
        .collect()
}

/// Aging boost preventing starvation of mid-priority files:
/// `min(cap, per_tick * ticks_pending)`.
pub fn aging_boost(ticks_pending: u64, per_tick: f64, cap: f64) -> f64 {
    (per_tick * ticks_pending as f64).min(cap)
}

/// Effective priority used by Transform's decision policy.
///
/// `intensity + aging_boost - inhibition + noise`, where the noise is a small
/// seeded tie-breaker so equal-priority candidates do not always resolve to
/// the lexicographically smallest id.
pub fn effective_priority<R: Rng>(
    intensity: f64,
    boost: f64,
    inhibition: f64,
    rng: &mut R,
) -> f64 {
    let noise: f64 = rng.gen_range(0.0..1e-6);
    intensity + boost - inhibition + noise
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn normalization_spans_clamp_range() {
        let normalized = normalize_batch(&[1.0, 3.0, 5.0], 0.1, 1.0);
        assert_eq!(normalized[0], 0.1);
        assert_eq!(normalized[2], 1.0);
        assert!((normalized[1] - 0.55).abs() < 1e-12);
    }

    #[test]
    fn degenerate_batch_maps_to_half() {
        let normalized = normalize_batch(&[2.0, 2.0], 0.1, 1.0);
        assert_eq!(normalized, vec![0.5, 0.5]);
    }

    #[test]
    fn aging_boost_is_capped() {
        assert_eq!(aging_boost(3, 0.01, 0.08), 0.03);
        assert_eq!(aging_boost(100, 0.01, 0.08), 0.08);
    }

    #[test]
    fn noise_does_not_dominate_priority_gaps() {
        let mut rng = StdRng::seed_from_u64(7);
        let high = effective_priority(0.9, 0.0, 0.0, &mut rng);
        let low = effective_priority(0.2, 0.08, 0.0, &mut rng);
        assert!(high > low);
    }
}
