//! Host-side link to a serial PID temperature controller.
//!
//! The controller streams `tick,temperature[,control]` lines over a serial
//! port. This crate drives that stream: it starts and stops acquisition,
//! filters outliers, writes accepted samples to CSV, monitors live readings,
//! changes the setpoint and plots recorded runs.
//!
//! # Filtering
//!
//! Each reading is checked against the last *accepted* reading with a
//! deadband of `max(floor, |prev| * ratio)`. The first reading of a session is
//! only checked against a plausible absolute range. Because the reference is
//! never a rejected reading, a genuine step change stays rejected until the
//! next session starts.
//!
//! # Example
//! ```no_run
//! use pidlog::{run_collection, CancelToken, SessionConfig};
//!
//! let config = SessionConfig {
//!     target: 500,
//!     ..SessionConfig::default()
//! };
//! let outcome = run_collection(&config, &CancelToken::new(), |_| {})?;
//! println!("{} samples, {}", outcome.accepted, outcome.reason);
//! # Ok::<(), pidlog::LinkError>(())
//! ```

pub mod config;
mod errors;
pub mod filter;
pub mod interrupt;
pub mod logging;
pub mod plot;
pub mod protocol;
pub mod session;
pub mod sink;
pub mod transport;

pub use config::{FilterConfig, LinkConfig, SessionConfig};
pub use errors::*;
pub use filter::{OutlierFilter, Verdict};
pub use interrupt::{catch_sigint, CancelToken, SigintGuard};
pub use plot::{PlotOutcome, Summary};
pub use protocol::{send_command, Command, Sample};
pub use session::{
    run_collection, run_monitor, run_set_setpoint, Event, Session, SessionOutcome, Termination,
};
pub use sink::{read_samples, CsvSink, SampleSink};
pub use transport::Transport;
