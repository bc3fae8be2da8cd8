//! Byte stream to the controller and line framing on top of it.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, info};
use serialport::{ClearBuffer, SerialPort};

use crate::config::LinkConfig;
use crate::errors::{LinkError, Result};

/// Longest line kept before the buffer is cut; the firmware never sends more
/// than 64 bytes per record.
const MAX_LINE: usize = 1024;

/// Upper bound for draining stale input on transports without a native clear.
const MAX_DRAIN: Duration = Duration::from_millis(200);

/// Read + Write stream whose reads time out instead of blocking forever.
pub trait Transport: Read + Write + Send {
    /// Drop whatever the device sent before we started listening.
    fn clear_input(&mut self) -> Result<()> {
        let mut buf = [0u8; 256];
        let start = Instant::now();
        loop {
            match self.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
            if start.elapsed() > MAX_DRAIN {
                break;
            }
        }
        Ok(())
    }
}

impl Transport for Box<dyn SerialPort> {
    fn clear_input(&mut self) -> Result<()> {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Open the configured serial port.
pub fn open_serial(link: &LinkConfig) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(&link.port, link.baud)
        .timeout(link.read_timeout)
        .open()
        .map_err(|source| LinkError::StreamUnavailable {
            port: link.port.clone(),
            source,
        })?;
    info!("connected to {} at {} baud", link.port, link.baud);
    Ok(port)
}

/// Result of one line read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadLine {
    /// A complete record, without its `\n`.
    Line(Vec<u8>),
    /// The read timed out before a full line arrived.
    Empty,
}

/// Splits a timed-out byte stream into `\n` terminated records.
///
/// Bytes of a line that is still incomplete when a read times out are kept
/// and completed by the next read.
#[derive(Debug, Default)]
pub struct LineReader {
    pending: Vec<u8>,
}

impl LineReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_line<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<ReadLine> {
        if let Some(line) = self.take_line() {
            return Ok(ReadLine::Line(line));
        }

        let mut buf = [0u8; 128];
        loop {
            match transport.read(&mut buf) {
                Ok(0) => return Ok(ReadLine::Empty),
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    if let Some(line) = self.take_line() {
                        return Ok(ReadLine::Line(line));
                    }
                    if self.pending.len() > MAX_LINE {
                        debug!("discarding {} bytes without line break", self.pending.len());
                        self.pending.clear();
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    return Ok(ReadLine::Empty);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    // A signal landed mid-read; let the caller look at its cancel flag.
                    return Ok(ReadLine::Empty);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }
}
