//! Symbol-rate / unit-interval recovery.

use tracing::debug;
use typed_builder::TypedBuilder;

/// How the nominal unit interval is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    /// Measure from reference-clock edges, falling back to the configured
    /// nominal value when too few edges are available.
    #[default]
    Auto,
    /// Always use the configured nominal value.
    Manual,
}

/// Derives the nominal unit-interval duration for downstream scaling and
/// clock-alignment decisions.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ClockRecovery {
    #[builder(default)]
    pub mode: RecoveryMode,
    /// Configured unit interval in femtoseconds; the fallback in `Auto`
    /// mode and the answer in `Manual` mode.
    pub nominal_fs: i64,
}

impl ClockRecovery {
    /// Compute the unit interval from reference-clock edge timestamps
    /// (femtoseconds, ascending).
    ///
    /// With at least 10 edges the inter-edge deltas are sorted and the top
    /// and bottom 10% discarded before averaging, so runt intervals and
    /// dropouts at either extreme do not skew the estimate.
    #[must_use]
    pub fn unit_interval(&self, edges: &[i64]) -> i64 {
        if self.mode == RecoveryMode::Manual {
            return self.nominal_fs;
        }
        if edges.len() < 10 {
            debug!(
                edges = edges.len(),
                "too few clock edges, using nominal unit interval"
            );
            return self.nominal_fs;
        }

        let mut deltas: Vec<i64> = edges.windows(2).map(|w| w[1] - w[0]).collect();
        deltas.sort_unstable();
        let trim = deltas.len() / 10;
        let kept = &deltas[trim..deltas.len() - trim];

        let sum: i128 = kept.iter().map(|&d| i128::from(d)).sum();
        (sum / kept.len() as i128) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_mode_ignores_edges() {
        let cr = ClockRecovery::builder()
            .mode(RecoveryMode::Manual)
            .nominal_fs(12_345)
            .build();
        let edges: Vec<i64> = (0..100).map(|i| i * 1000).collect();
        assert_eq!(cr.unit_interval(&edges), 12_345);
    }

    #[test]
    fn few_edges_fall_back_to_nominal() {
        let cr = ClockRecovery::builder().nominal_fs(100_000).build();
        let edges = [0, 1000, 2000, 3000];
        assert_eq!(cr.unit_interval(&edges), 100_000);
    }

    #[test]
    fn trimmed_mean_rejects_outliers() {
        // 20 edges nominally 1000 fs apart with one runt and one dropout;
        // both land in the trimmed tails.
        let mut edges = Vec::new();
        let mut t = 0i64;
        for i in 0..20 {
            edges.push(t);
            t += match i {
                5 => 10,     // runt interval
                12 => 9_000, // dropout
                _ => 1000,
            };
        }
        let cr = ClockRecovery::builder().nominal_fs(500).build();
        assert_eq!(cr.unit_interval(&edges), 1000);
    }

    #[test]
    fn jittered_edges_average_out() {
        // alternating +/- 40 fs of jitter around 1000
        let edges: Vec<i64> = (0..50)
            .scan(0i64, |acc, i| {
                *acc += if i % 2 == 0 { 960 } else { 1040 };
                Some(*acc)
            })
            .collect();
        let cr = ClockRecovery::builder().nominal_fs(0).build();
        let ui = cr.unit_interval(&edges);
        assert!((960..=1040).contains(&ui), "ui = {ui}");
    }
}
