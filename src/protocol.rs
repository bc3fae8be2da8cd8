//! Text line protocol spoken by the controller firmware.
//!
//! Host to device: newline-terminated commands (`/safeData: N`, `/monitor`,
//! `/set yr: 28.5`, `/stop`). Device to host: one `tick,temperature[,control]`
//! record per line, plus a bare `10` echo and free-form informational lines.

use std::fmt;
use std::io::Write;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::{RecordError, Result};

/// Commands understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Stream `Some(n)` samples, or stream without a bound.
    SafeData(Option<u64>),
    /// Stream readings for display only.
    Monitor,
    /// Change the PID setpoint (yr).
    SetSetpoint(f64),
    /// Halt streaming and disable actuation.
    Stop,
}

impl Command {
    /// Start command for a collection run; a target of 0 means unbounded.
    pub fn start(target: u64) -> Self {
        if target > 0 {
            Command::SafeData(Some(target))
        } else {
            Command::SafeData(None)
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SafeData(Some(n)) => write!(f, "/safeData: {n}"),
            Command::SafeData(None) => f.write_str("/safeData"),
            Command::Monitor => f.write_str("/monitor"),
            Command::SetSetpoint(yr) => write!(f, "/set yr: {yr}"),
            Command::Stop => f.write_str("/stop"),
        }
    }
}

/// Write a command followed by a line terminator and flush it out.
///
/// There is no acknowledgement wait here; callers that expect a reply sleep
/// for their own ack delay.
pub fn send_command<W: Write + ?Sized>(out: &mut W, cmd: Command) -> Result<()> {
    let line = format!("{cmd}\n");
    out.write_all(line.as_bytes())?;
    out.flush()?;
    debug!("sent {:?}", cmd.to_string());
    Ok(())
}

/// One parsed measurement record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub tick: f64,
    pub temperature: f64,
    pub control: Option<f64>,
}

impl Sample {
    pub fn new(tick: f64, temperature: f64, control: Option<f64>) -> Self {
        Self {
            tick,
            temperature,
            control,
        }
    }

    /// Parse already-split fields. Fields are trimmed first since the firmware
    /// prints `"%lu, %.2f"`.
    pub fn from_fields<'a, I>(fields: I) -> std::result::Result<Self, RecordError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let fields: Vec<&str> = fields.into_iter().map(str::trim).collect();
        match fields.len() {
            n if n < 2 => return Err(RecordError::TooFewFields(n)),
            n if n > 3 => return Err(RecordError::TooManyFields(n)),
            _ => {}
        }

        let mut values = [0.0f64; 3];
        for (index, field) in fields.iter().enumerate() {
            // `inf` and `NaN` parse as f64 but are never valid decimal fields.
            values[index] = field
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| RecordError::NotNumeric {
                    index,
                    value: field.to_string(),
                })?;
        }

        let control = (fields.len() == 3).then_some(values[2]);
        Ok(Sample::new(values[0], values[1], control))
    }
}

/// What a single line from the device turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    /// Nothing but whitespace.
    Blank,
    /// A known no-op echo such as `10`.
    Sentinel,
    /// Text without a comma, e.g. a firmware banner.
    Info(String),
    Sample(Sample),
}

/// Classify one trimmed line. `is_sentinel` decides which bare lines are echoes.
pub fn classify_line<F>(line: &str, is_sentinel: F) -> std::result::Result<Line, RecordError>
where
    F: Fn(&str) -> bool,
{
    let line = line.trim();
    if line.is_empty() {
        return Ok(Line::Blank);
    }
    if is_sentinel(line) {
        return Ok(Line::Sentinel);
    }
    if !line.contains(',') {
        return Ok(Line::Info(line.to_string()));
    }
    Sample::from_fields(line.split(',')).map(Line::Sample)
}

/// Decode raw record bytes. Invalid UTF-8 drops the whole record.
pub fn decode_record(raw: &[u8]) -> std::result::Result<&str, RecordError> {
    std::str::from_utf8(raw).map_err(|_| RecordError::Decode)
}
