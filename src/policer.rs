//! Leaky-bucket ("GCRA") policer.
//!
//! Decides whether an event stream conforms to a configured rate. A bucket
//! drains continuously at `drain_rate` units per second and each event adds
//! its weight; an event conforms while the pre-add level is below
//! `bucket_size`. Channels use one for join floods, users for auth attempts.

use serde::Deserialize;

/// Rate parameters, shared between all policers of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PolicerParams {
    /// Maximum accumulated weight before events stop conforming.
    pub size: f64,
    /// Weight drained per second.
    #[serde(rename = "drain-rate")]
    pub drain_rate: f64,
}

impl PolicerParams {
    pub fn new(size: f64, drain_rate: f64) -> Self {
        Self { size, drain_rate }
    }
}

/// Per-entity bucket state.
#[derive(Debug, Clone, Default)]
pub struct Policer {
    level: f64,
    last_req: i64,
}

impl Policer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event of `weight` at `now`; returns whether it conforms.
    pub fn conforms(&mut self, params: &PolicerParams, now: i64, weight: f64) -> bool {
        self.level -= params.drain_rate * (now - self.last_req) as f64;
        if self.level < 0.0 {
            self.level = 0.0;
        }
        let res = self.level < params.size;
        self.level += weight;
        self.last_req = now;
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_fills_and_drains() {
        let params = PolicerParams::new(2.0, 1.0);
        let mut pol = Policer::new();

        // Two quick events fit in the bucket, the third does not.
        assert!(pol.conforms(&params, 100, 1.0));
        assert!(pol.conforms(&params, 100, 1.0));
        assert!(!pol.conforms(&params, 100, 1.0));

        // After three seconds of drain we conform again.
        assert!(pol.conforms(&params, 103, 1.0));
    }

    #[test]
    fn level_clamps_at_zero() {
        let params = PolicerParams::new(1.5, 10.0);
        let mut pol = Policer::new();
        assert!(pol.conforms(&params, 0, 1.0));
        // A long gap must not bank negative credit.
        assert!(pol.conforms(&params, 1000, 1.0));
        assert!(!pol.conforms(&params, 1000, 1.0));
    }
}
