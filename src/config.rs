//! Session configuration.
//!
//! Every tunable of the acquisition loop lives here so that callers pass one
//! explicit value into each operation. The defaults follow the controller
//! firmware: 115200 baud, one reading per line, a board reset on port open.

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{LinkError, Result};

/// Default serial port for the controller board.
#[cfg(windows)]
pub const DEFAULT_PORT: &str = "COM5";
#[cfg(not(windows))]
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";

/// Default serial baud rate of the controller firmware.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Default CSV file written by a collection run.
pub const DEFAULT_OUTPUT: &str = "pid_data.csv";

/// Per-read timeout on the serial port.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Time for the board to come back up after the port open toggles DTR.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Wait after a command that the device acknowledges.
const ACK_DELAY: Duration = Duration::from_millis(100);

/// Sleep between empty reads in monitor mode.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Consecutive empty reads that end a session.
pub const DEFAULT_EMPTY_READ_LIMIT: u32 = 5;

/// Smallest jump the outlier filter always allows.
pub const DEFAULT_FLOOR: f64 = 0.5;

/// Allowed jump as a fraction of the last accepted temperature.
pub const DEFAULT_RATIO: f64 = 0.10;

/// Plausible range for the first temperature of a session.
pub const DEFAULT_MIN_PLAUSIBLE: f64 = -50.0;
pub const DEFAULT_MAX_PLAUSIBLE: f64 = 250.0;

/// Number of progress notifications per bounded run (20 % steps).
const PROGRESS_STEPS: u32 = 5;

/// Lines the device echoes back that carry no data.
const ECHO_SENTINELS: &[&str] = &["10"];

/// Serial link parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub port: String,
    pub baud: u32,
    pub read_timeout: Duration,
    pub settle_delay: Duration,
    pub ack_delay: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud: DEFAULT_BAUD,
            read_timeout: DEFAULT_READ_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            ack_delay: ACK_DELAY,
        }
    }
}

/// Constants of the deadband outlier filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterConfig {
    /// Smallest allowed jump, whatever the magnitude of the last value.
    pub floor: f64,
    /// Allowed jump as a fraction of the last accepted value.
    pub ratio: f64,
    /// Plausible range for the first sample of a session.
    pub min_plausible: f64,
    pub max_plausible: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            floor: DEFAULT_FLOOR,
            ratio: DEFAULT_RATIO,
            min_plausible: DEFAULT_MIN_PLAUSIBLE,
            max_plausible: DEFAULT_MAX_PLAUSIBLE,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.floor.is_finite() && self.floor >= 0.0) {
            return Err(LinkError::InvalidConfig(format!(
                "filter floor must be a non-negative number, got {}",
                self.floor
            )));
        }
        if !(self.ratio.is_finite() && self.ratio >= 0.0) {
            return Err(LinkError::InvalidConfig(format!(
                "filter ratio must be a non-negative number, got {}",
                self.ratio
            )));
        }
        if !(self.min_plausible <= self.max_plausible) {
            return Err(LinkError::InvalidConfig(format!(
                "plausible range is empty: [{}, {}]",
                self.min_plausible, self.max_plausible
            )));
        }
        Ok(())
    }
}

/// Everything one acquisition session needs. Immutable while the session runs.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub link: LinkConfig,
    pub filter: FilterConfig,
    /// Samples to accept before stopping; 0 means run until timeout or cancel.
    pub target: u64,
    pub output: PathBuf,
    pub empty_read_limit: u32,
    pub progress_steps: u32,
    pub poll_interval: Duration,
    pub sentinels: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            filter: FilterConfig::default(),
            target: 0,
            output: PathBuf::from(DEFAULT_OUTPUT),
            empty_read_limit: DEFAULT_EMPTY_READ_LIMIT,
            progress_steps: PROGRESS_STEPS,
            poll_interval: POLL_INTERVAL,
            sentinels: ECHO_SENTINELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.link.port.trim().is_empty() {
            return Err(LinkError::InvalidConfig("serial port is empty".into()));
        }
        if self.link.baud == 0 {
            return Err(LinkError::InvalidConfig("baud rate must be positive".into()));
        }
        if self.empty_read_limit == 0 {
            return Err(LinkError::InvalidConfig(
                "empty read limit must be at least 1".into(),
            ));
        }
        self.filter.validate()
    }

    /// Whether a trimmed line is one of the device's no-op echoes.
    pub fn is_sentinel(&self, line: &str) -> bool {
        self.sentinels.iter().any(|s| s == line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.is_sentinel("10"));
        assert!(!config.is_sentinel("1,10"));
    }

    #[test]
    fn rejects_bad_filter_constants() {
        let mut filter = FilterConfig {
            ratio: -0.1,
            ..FilterConfig::default()
        };
        assert!(filter.validate().is_err());

        filter.ratio = 0.003;
        filter.min_plausible = 300.0;
        assert!(filter.validate().is_err());

        filter.min_plausible = f64::NAN;
        assert!(filter.validate().is_err());
    }

    #[test]
    fn rejects_zero_empty_read_limit() {
        let config = SessionConfig {
            empty_read_limit: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LinkError::InvalidConfig(_))
        ));
    }
}
