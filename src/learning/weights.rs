//! Learned scoring weights
//!
//! Weights move by the success-versus-failure contrast of each feature over the
//! recent history, then get projected back inside `[min_weight, max_weight]`
//! with a total of 1.0. Readers load the current vector lock-free.

use crate::config::LearningConfig;
use crate::routing::scoring::ScoringWeights;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Published weight vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    #[serde(flatten)]
    pub weights: ScoringWeights,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Lock-free holder of the current weight vector
#[derive(Debug)]
pub struct WeightStore {
    current: ArcSwap<WeightVector>,
}

impl WeightStore {
    /// Start at version 0 with the given weights, normalized
    pub fn new(baseline: ScoringWeights, now: DateTime<Utc>) -> Self {
        Self {
            current: ArcSwap::from_pointee(WeightVector {
                weights: baseline.normalized(),
                version: 0,
                updated_at: now,
            }),
        }
    }

    pub fn current(&self) -> Arc<WeightVector> {
        self.current.load_full()
    }

    /// Publish new weights under the next version
    pub fn publish(&self, weights: ScoringWeights, now: DateTime<Utc>) -> Arc<WeightVector> {
        let next = Arc::new(WeightVector {
            weights,
            version: self.current.load().version + 1,
            updated_at: now,
        });
        self.current.store(Arc::clone(&next));
        next
    }
}

/// Feature values of one historical outcome, `None` where not observed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureSample {
    pub success: bool,
    pub features: [Option<f64>; 4],
}

/// Mean feature among successes minus mean among failures, per dimension.
/// Zero when either group has no finite observation.
pub fn feature_deltas(samples: &[FeatureSample]) -> [f64; 4] {
    let mut deltas = [0.0; 4];
    for (dim, delta) in deltas.iter_mut().enumerate() {
        let mean = |success: bool| -> Option<f64> {
            let values: Vec<f64> = samples
                .iter()
                .filter(|s| s.success == success)
                .filter_map(|s| s.features[dim])
                .filter(|v| v.is_finite())
                .collect();
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        };
        if let (Some(ok), Some(failed)) = (mean(true), mean(false)) {
            *delta = (ok - failed).clamp(-1.0, 1.0);
        }
    }
    deltas
}

/// Scale to sum 1.0 while keeping every weight in `[min, max]`.
///
/// Weights that would leave the bounds are pinned to the bound and the rest are
/// rescaled over the remaining mass, until nothing moves.
pub fn bounded_normalize(raw: [f64; 4], min: f64, max: f64) -> [f64; 4] {
    let raw = raw.map(|w| if w.is_finite() { w.max(0.0) } else { 0.0 });
    let mut pinned: [Option<f64>; 4] = [None; 4];

    loop {
        let pinned_sum: f64 = pinned.iter().flatten().sum();
        let free: Vec<usize> = (0..4).filter(|i| pinned[*i].is_none()).collect();
        if free.is_empty() {
            break;
        }

        let remaining = (1.0 - pinned_sum).max(0.0);
        let free_sum: f64 = free.iter().map(|i| raw[*i]).sum();
        let scaled = |i: usize| {
            if free_sum > 0.0 {
                raw[i] * remaining / free_sum
            } else {
                remaining / free.len() as f64
            }
        };

        // Upper bound first: pinning at max only raises the others
        let over: Vec<usize> = free.iter().copied().filter(|i| scaled(*i) > max).collect();
        if !over.is_empty() {
            for i in over {
                pinned[i] = Some(max);
            }
            continue;
        }

        let under: Vec<usize> = free.iter().copied().filter(|i| scaled(*i) < min).collect();
        if !under.is_empty() {
            for i in under {
                pinned[i] = Some(min);
            }
            continue;
        }

        for &i in &free {
            pinned[i] = Some(scaled(i));
        }
        break;
    }

    let result = pinned.map(|w| w.unwrap_or(min));
    let sum: f64 = result.iter().sum();
    if (sum - 1.0).abs() > 1e-9 && sum > 0.0 {
        // Only reachable with bounds that cannot sum to 1.0
        return result.map(|w| w / sum);
    }
    result
}

/// One learning step applied to `current`
pub fn adjust_weights(
    current: &ScoringWeights,
    samples: &[FeatureSample],
    config: &LearningConfig,
) -> ScoringWeights {
    let deltas = feature_deltas(samples);
    let mut raw = current.as_array();
    for (w, delta) in raw.iter_mut().zip(deltas.iter()) {
        *w *= 1.0 + config.learning_rate * delta;
    }
    ScoringWeights::from_array(bounded_normalize(
        raw,
        config.min_weight,
        config.max_weight,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(success: bool, features: [f64; 4]) -> FeatureSample {
        FeatureSample {
            success,
            features: features.map(Some),
        }
    }

    #[test]
    fn test_deltas_contrast_successes_and_failures() {
        let samples = vec![
            sample(true, [0.9, 0.8, 0.5, 1.0]),
            sample(true, [0.9, 0.6, 0.5, 1.0]),
            sample(false, [0.4, 0.2, 0.5, 0.0]),
        ];
        let deltas = feature_deltas(&samples);
        assert!((deltas[0] - 0.5).abs() < 1e-9);
        assert!((deltas[1] - 0.5).abs() < 1e-9);
        assert_eq!(deltas[2], 0.0);
        assert!((deltas[3] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_deltas_zero_without_failures() {
        let samples = vec![sample(true, [1.0; 4]), sample(true, [0.5; 4])];
        assert_eq!(feature_deltas(&samples), [0.0; 4]);
    }

    #[test]
    fn test_non_finite_and_missing_features_skipped() {
        let samples = vec![
            FeatureSample {
                success: true,
                features: [Some(f64::NAN), Some(1.0), None, Some(1.0)],
            },
            FeatureSample {
                success: false,
                features: [Some(0.5), Some(0.0), Some(0.3), None],
            },
        ];
        let deltas = feature_deltas(&samples);
        assert_eq!(deltas[0], 0.0);
        assert_eq!(deltas[1], 1.0);
        assert_eq!(deltas[2], 0.0);
        assert_eq!(deltas[3], 0.0);
    }

    #[test]
    fn test_bounded_normalize_pins_extremes() {
        let result = bounded_normalize([10.0, 0.0, 0.0, 0.0], 0.05, 0.6);
        assert!((result[0] - 0.6).abs() < 1e-9);
        for w in &result[1..] {
            assert!((w - 0.4 / 3.0).abs() < 1e-9);
        }
        assert!((result.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_adjust_moves_toward_predictive_dimension() {
        let config = LearningConfig::default();
        let current = ScoringWeights::default();
        let samples = vec![
            sample(true, [0.95, 0.5, 0.5, 0.5]),
            sample(false, [0.2, 0.5, 0.5, 0.5]),
        ];
        let next = adjust_weights(&current, &samples, &config);
        assert!(next.reliability > current.reliability);
        assert!(next.cost < current.cost);
        assert!((next.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_store_publishes_incrementing_versions() {
        let now = Utc::now();
        let store = WeightStore::new(ScoringWeights::default(), now);
        assert_eq!(store.current().version, 0);

        let published = store.publish(ScoringWeights::default(), now);
        assert_eq!(published.version, 1);
        assert_eq!(store.current().version, 1);
    }

    proptest! {
        #[test]
        fn prop_weights_stay_bounded(
            start in prop::array::uniform4(0.05f64..0.6),
            rows in prop::collection::vec(
                (any::<bool>(), prop::array::uniform4(prop::option::of(-0.5f64..1.5))),
                0..60,
            ),
            steps in 1usize..6,
        ) {
            let config = LearningConfig::default();
            let samples: Vec<FeatureSample> = rows
                .into_iter()
                .map(|(success, features)| FeatureSample { success, features })
                .collect();

            let mut weights = ScoringWeights::from_array(start).normalized();
            for _ in 0..steps {
                weights = adjust_weights(&weights, &samples, &config);
                let sum = weights.sum();
                prop_assert!((sum - 1.0).abs() < 1e-6, "sum {}", sum);
                for w in weights.as_array() {
                    prop_assert!(w > 0.0);
                    prop_assert!(w >= config.min_weight - 1e-9);
                    prop_assert!(w <= config.max_weight + 1e-9);
                }
            }
        }
    }
}
