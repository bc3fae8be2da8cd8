//! Deadband outlier filter for temperature readings.
//!
//! A reading is compared with the last *accepted* reading, never the last raw
//! one. The consequence is that a real step change (for instance after the
//! setpoint was raised) keeps being rejected until a new session starts with a
//! fresh filter. That limitation is deliberate and kept as-is.

use crate::config::FilterConfig;

/// Outcome of checking one reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Accept,
    /// First reading of the session is outside the plausible range.
    OutOfRange,
    /// Jump from the last accepted reading exceeds the margin.
    Jump { delta: f64, margin: f64 },
    /// NaN or infinity.
    NotFinite,
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

#[derive(Debug, Clone)]
pub struct OutlierFilter {
    config: FilterConfig,
    last: Option<f64>,
}

impl OutlierFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config, last: None }
    }

    /// Last accepted value, if any.
    pub fn last(&self) -> Option<f64> {
        self.last
    }

    /// Allowed deviation around `prev`: `max(floor, |prev| * ratio)`.
    pub fn margin(&self, prev: f64) -> f64 {
        self.config.floor.max(prev.abs() * self.config.ratio)
    }

    /// Check a reading without touching the filter state.
    pub fn check(&self, cur: f64) -> Verdict {
        if !cur.is_finite() {
            return Verdict::NotFinite;
        }
        match self.last {
            None => {
                if cur < self.config.min_plausible || cur > self.config.max_plausible {
                    Verdict::OutOfRange
                } else {
                    Verdict::Accept
                }
            }
            Some(prev) => {
                let delta = (cur - prev).abs();
                let margin = self.margin(prev);
                if delta > margin {
                    Verdict::Jump { delta, margin }
                } else {
                    Verdict::Accept
                }
            }
        }
    }

    /// Check a reading and remember it when accepted.
    pub fn admit(&mut self, cur: f64) -> Verdict {
        let verdict = self.check(cur);
        if verdict.is_accept() {
            self.last = Some(cur);
        }
        verdict
    }
}
