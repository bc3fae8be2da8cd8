//! Acquisition sessions against the controller.
//!
//! A [`Session`] owns the stream for one operation: a bounded or unbounded
//! collection run, live monitoring, or a setpoint change. Collection and
//! monitoring consume the session, so the port is closed when they return.
//!
//! # Collection protocol
//!
//! 1. open the port and wait for the board to settle after its reset
//! 2. clear stale input
//! 3. send `/safeData[: N]`
//! 4. read lines until the target is reached, too many consecutive reads come
//!    back empty, or the cancel token is raised
//!
//! A `/stop` is sent on every way out of the loop, errors included.

use std::fmt;
use std::thread;

use log::{debug, info, warn};
use serialport::SerialPort;

use crate::config::{LinkConfig, SessionConfig};
use crate::errors::{LinkError, RecordError, Result};
use crate::filter::{OutlierFilter, Verdict};
use crate::interrupt::CancelToken;
use crate::protocol::{classify_line, decode_record, send_command, Command, Line, Sample};
use crate::sink::{CsvSink, SampleSink};
use crate::transport::{open_serial, LineReader, ReadLine, Transport};

/// Most reply lines read back after a setpoint change.
const MAX_ACK_LINES: usize = 8;

/// Why a session ended. All three are normal endings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    TargetReached,
    Timeout,
    UserCancelled,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::TargetReached => f.write_str("target reached"),
            Termination::Timeout => f.write_str("device went quiet"),
            Termination::UserCancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub accepted: u64,
    /// Parsed samples the outlier filter threw away.
    pub rejected: u64,
    /// Records dropped before filtering (undecodable or malformed).
    pub skipped: u64,
    pub reason: Termination,
}

/// Notifications emitted while a session runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event<'a> {
    Accepted { sample: &'a Sample, count: u64 },
    Rejected { sample: &'a Sample, verdict: Verdict },
    Skipped { line: &'a str, error: &'a RecordError },
    /// Free-form text from the device.
    Info(&'a str),
    Progress { accepted: u64, target: u64, percent: u32 },
    /// A line forwarded by monitor mode.
    Line(&'a str),
}

/// Sends `/stop` when dropped unless stopped explicitly first.
struct StopGuard<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    armed: bool,
}

impl<'a, T: Transport + ?Sized> StopGuard<'a, T> {
    fn new(transport: &'a mut T) -> Self {
        Self {
            transport,
            armed: true,
        }
    }

    /// Send the stop command now. Failure is logged, the device may be gone.
    fn stop(mut self) {
        self.armed = false;
        if let Err(e) = send_command(&mut *self.transport, Command::Stop) {
            warn!("failed to send stop command: {e}");
        }
    }
}

impl<T: Transport + ?Sized> Drop for StopGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = send_command(&mut *self.transport, Command::Stop) {
                warn!("failed to send stop command while unwinding: {e}");
            }
        }
    }
}

/// Emits the 20/40/60/80/100 % style notifications of a bounded run.
struct Milestones {
    target: u64,
    steps: u64,
    next: u64,
}

impl Milestones {
    fn new(target: u64, steps: u32) -> Self {
        Self {
            target,
            steps: u64::from(steps),
            next: 1,
        }
    }

    /// Percentages crossed by reaching `accepted`.
    fn crossed(&mut self, accepted: u64) -> Vec<u32> {
        let mut crossed = Vec::new();
        if self.target == 0 {
            return crossed;
        }
        while self.next <= self.steps && accepted * self.steps >= self.target * self.next {
            crossed.push((self.next * 100 / self.steps) as u32);
            self.next += 1;
        }
        crossed
    }
}

pub struct Session<T: Transport> {
    transport: T,
    reader: LineReader,
}

impl Session<Box<dyn SerialPort>> {
    /// Open the serial port and give the board time to come out of reset.
    pub fn open(link: &LinkConfig) -> Result<Self> {
        let port = open_serial(link)?;
        if !link.settle_delay.is_zero() {
            debug!("waiting {:?} for the board to settle", link.settle_delay);
            thread::sleep(link.settle_delay);
        }
        Ok(Self::new(port))
    }
}

impl<T: Transport> Session<T> {
    /// Wrap an already-open stream.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            reader: LineReader::new(),
        }
    }

    /// Run one collection session, appending accepted samples to `sink`.
    pub fn collect<S, F>(
        mut self,
        config: &SessionConfig,
        sink: &mut S,
        cancel: &CancelToken,
        mut observer: F,
    ) -> Result<SessionOutcome>
    where
        S: SampleSink + ?Sized,
        F: FnMut(&Event<'_>),
    {
        config.validate()?;

        let mut filter = OutlierFilter::new(config.filter);
        let mut milestones = Milestones::new(config.target, config.progress_steps);
        let mut accepted = 0u64;
        let mut rejected = 0u64;
        let mut skipped = 0u64;
        let mut empty_reads = 0u32;

        self.transport.clear_input()?;
        let mut guard = StopGuard::new(&mut self.transport);
        send_command(&mut *guard.transport, Command::start(config.target))?;
        info!(
            "collecting {} to {}",
            match config.target {
                0 => "until the device goes quiet".to_string(),
                n => format!("{n} samples"),
            },
            config.output.display()
        );

        let reason = loop {
            if cancel.is_cancelled() {
                break Termination::UserCancelled;
            }

            let raw = match self.reader.read_line(&mut *guard.transport)? {
                ReadLine::Line(raw) if !raw.iter().all(u8::is_ascii_whitespace) => raw,
                _ => {
                    empty_reads += 1;
                    if empty_reads >= config.empty_read_limit {
                        break Termination::Timeout;
                    }
                    continue;
                }
            };
            empty_reads = 0;

            let parsed = decode_record(&raw)
                .and_then(|text| classify_line(text, |l| config.is_sentinel(l)));
            let sample = match parsed {
                Ok(Line::Sample(sample)) => sample,
                Ok(Line::Info(text)) => {
                    info!("device: {text}");
                    observer(&Event::Info(&text));
                    continue;
                }
                Ok(Line::Sentinel) | Ok(Line::Blank) => continue,
                Err(error) => {
                    let line = String::from_utf8_lossy(&raw);
                    warn!("skipping record {line:?}: {error}");
                    skipped += 1;
                    observer(&Event::Skipped {
                        line: &line,
                        error: &error,
                    });
                    continue;
                }
            };

            let reference = filter.last();
            let verdict = filter.admit(sample.temperature);
            if !verdict.is_accept() {
                debug!("rejected {sample:?} against {reference:?}: {verdict:?}");
                rejected += 1;
                observer(&Event::Rejected {
                    sample: &sample,
                    verdict,
                });
                continue;
            }

            sink.append(&sample)?;
            accepted += 1;
            observer(&Event::Accepted {
                sample: &sample,
                count: accepted,
            });

            for percent in milestones.crossed(accepted) {
                info!("collected {accepted}/{} samples ({percent}%)", config.target);
                observer(&Event::Progress {
                    accepted,
                    target: config.target,
                    percent,
                });
            }

            if config.target > 0 && accepted >= config.target {
                break Termination::TargetReached;
            }
        };

        guard.stop();
        sink.flush()?;

        info!("session ended ({reason}): {accepted} accepted, {rejected} rejected, {skipped} skipped");
        Ok(SessionOutcome {
            accepted,
            rejected,
            skipped,
            reason,
        })
    }

    /// Forward every line the device sends until `cancel` is raised.
    ///
    /// Returns the number of forwarded lines.
    pub fn monitor<F>(mut self, config: &SessionConfig, cancel: &CancelToken, mut observer: F) -> Result<u64>
    where
        F: FnMut(&Event<'_>),
    {
        self.transport.clear_input()?;
        let mut guard = StopGuard::new(&mut self.transport);
        send_command(&mut *guard.transport, Command::Monitor)?;
        info!("monitoring, press Ctrl+C to stop");

        let mut forwarded = 0u64;
        while !cancel.is_cancelled() {
            match self.reader.read_line(&mut *guard.transport)? {
                ReadLine::Line(raw) => {
                    let text = String::from_utf8_lossy(&raw);
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    forwarded += 1;
                    observer(&Event::Line(text));
                }
                ReadLine::Empty => {
                    if !config.poll_interval.is_zero() {
                        thread::sleep(config.poll_interval);
                    }
                }
            }
        }

        guard.stop();
        info!("monitoring stopped after {forwarded} lines");
        Ok(forwarded)
    }

    /// Send a new setpoint and collect whatever the device replies.
    pub fn set_setpoint(&mut self, link: &LinkConfig, yr: f64) -> Result<Vec<String>> {
        if !yr.is_finite() {
            return Err(LinkError::InvalidConfig(format!(
                "setpoint must be a finite number, got {yr}"
            )));
        }

        // Anything still buffered would be mistaken for the acknowledgement.
        self.transport.clear_input()?;
        send_command(&mut self.transport, Command::SetSetpoint(yr))?;
        if !link.ack_delay.is_zero() {
            thread::sleep(link.ack_delay);
        }

        let mut replies = Vec::new();
        while replies.len() < MAX_ACK_LINES {
            match self.reader.read_line(&mut self.transport)? {
                ReadLine::Line(raw) => {
                    let text = String::from_utf8_lossy(&raw).trim().to_string();
                    if !text.is_empty() {
                        info!("device replied: {text}");
                        replies.push(text);
                    }
                }
                ReadLine::Empty => break,
            }
        }
        if replies.is_empty() {
            debug!("no reply to setpoint change");
        }
        info!("setpoint set to {yr}");
        Ok(replies)
    }
}

/// Open the configured port and CSV file and run one collection session.
///
/// The port is opened first so that a missing device does not truncate an
/// existing data file.
pub fn run_collection<F>(config: &SessionConfig, cancel: &CancelToken, observer: F) -> Result<SessionOutcome>
where
    F: FnMut(&Event<'_>),
{
    config.validate()?;
    let session = Session::open(&config.link)?;
    let mut sink = CsvSink::create(&config.output)?;
    let outcome = session.collect(config, &mut sink, cancel, observer)?;
    info!("wrote {} rows to {}", sink.rows(), config.output.display());
    Ok(outcome)
}

/// Open the configured port and monitor it until cancelled.
pub fn run_monitor<F>(config: &SessionConfig, cancel: &CancelToken, observer: F) -> Result<u64>
where
    F: FnMut(&Event<'_>),
{
    Session::open(&config.link)?.monitor(config, cancel, observer)
}

/// Open the configured port and change the setpoint.
pub fn run_set_setpoint(link: &LinkConfig, yr: f64) -> Result<Vec<String>> {
    Session::open(link)?.set_setpoint(link, yr)
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::time::Duration;

    use super::*;
    use crate::config::FilterConfig;
    use crate::transport::mock::{written_text, MockTransport, Step};

    fn config(target: u64) -> SessionConfig {
        SessionConfig {
            target,
            empty_read_limit: 3,
            poll_interval: Duration::ZERO,
            filter: FilterConfig {
                floor: 0.5,
                ratio: 0.10,
                ..FilterConfig::default()
            },
            ..SessionConfig::default()
        }
    }

    fn collect(lines: &[&str], config: &SessionConfig) -> (SessionOutcome, Vec<Sample>, String) {
        let (transport, written) = MockTransport::lines(lines);
        let mut sink: Vec<Sample> = Vec::new();
        let outcome = Session::new(transport)
            .collect(config, &mut sink, &CancelToken::new(), |_| {})
            .unwrap();
        (outcome, sink, written_text(&written))
    }

    #[test]
    fn filters_jump_in_scenario() {
        let (outcome, sink, _) = collect(&["1,20.0", "2,20.3", "3,40.0", "4,20.5"], &config(0));
        assert_eq!(
            sink,
            vec![
                Sample::new(1.0, 20.0, None),
                Sample::new(2.0, 20.3, None),
                Sample::new(4.0, 20.5, None),
            ]
        );
        assert_eq!(outcome.accepted, 3);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.reason, Termination::Timeout);
    }

    #[test]
    fn stops_when_target_reached() {
        let (outcome, sink, written) =
            collect(&["1,20.0", "2,20.1", "3,20.2", "4,20.3"], &config(2));
        assert_eq!(outcome.reason, Termination::TargetReached);
        assert_eq!(outcome.accepted, 2);
        assert_eq!(sink.len(), 2);
        assert_eq!(written, "/safeData: 2\n/stop\n");
    }

    #[test]
    fn times_out_short_of_target() {
        let (outcome, sink, written) = collect(&["1,20.0"], &config(2));
        assert_eq!(outcome.reason, Termination::Timeout);
        assert_eq!(outcome.accepted, 1);
        assert_eq!(sink.len(), 1);
        assert_eq!(written, "/safeData: 2\n/stop\n");
    }

    #[test]
    fn unbounded_run_sends_bare_start() {
        let (outcome, _, written) = collect(&["1,20.0", "2,20.0"], &config(0));
        assert_eq!(outcome.reason, Termination::Timeout);
        assert!(written.starts_with("/safeData\n"));
    }

    #[test]
    fn noise_never_reaches_sink() {
        let lines = [
            "Time_ms, Voltage_V",
            "10",
            "PID ready",
            "",
            "1, 25.00, 300",
            "2,abc",
            "1,2,3,4",
            "3, 25.10, 310",
        ];
        let (transport, _) = MockTransport::lines(&lines);
        let mut sink: Vec<Sample> = Vec::new();
        let mut infos = Vec::new();
        let outcome = Session::new(transport)
            .collect(&config(2), &mut sink, &CancelToken::new(), |event| {
                if let Event::Info(text) = event {
                    infos.push(text.to_string());
                }
            })
            .unwrap();

        assert_eq!(outcome.reason, Termination::TargetReached);
        assert_eq!(outcome.skipped, 3);
        assert_eq!(
            sink,
            vec![
                Sample::new(1.0, 25.0, Some(300.0)),
                Sample::new(3.0, 25.1, Some(310.0))
            ]
        );
        assert_eq!(infos, vec!["PID ready".to_string()]);
    }

    #[test]
    fn non_finite_fields_are_skipped() {
        let lines = ["inf,20.0", "nan,20.1,NaN", "3,20.2,inf", "4,20.0"];
        let (outcome, sink, _) = collect(&lines, &config(1));
        assert_eq!(outcome.reason, Termination::TargetReached);
        assert_eq!(outcome.skipped, 3);
        assert_eq!(sink, vec![Sample::new(4.0, 20.0, None)]);
    }

    #[test]
    fn empty_reads_must_be_consecutive() {
        let (transport, written) = MockTransport::new(vec![
            Step::Data(b"1,20.0\n".to_vec()),
            Step::Timeout,
            Step::Timeout,
            Step::Data(b"2,20.1\n".to_vec()),
            Step::Timeout,
            Step::Data(b"\r\n".to_vec()),
            Step::Data(b"3,20.2\n".to_vec()),
        ]);
        let mut sink: Vec<Sample> = Vec::new();
        // Four empty reads in total, never three in a row.
        let outcome = Session::new(transport)
            .collect(&config(3), &mut sink, &CancelToken::new(), |_| {})
            .unwrap();
        assert_eq!(outcome.reason, Termination::TargetReached);
        assert_eq!(outcome.accepted, 3);
        assert_eq!(written_text(&written), "/safeData: 3\n/stop\n");
    }

    #[test]
    fn invalid_utf8_is_skipped_not_fatal() {
        let (transport, _) = MockTransport::new(vec![
            Step::Data(vec![b'1', b',', 0xfe, b'\n']),
            Step::Data(b"2,21.0\n".to_vec()),
        ]);
        let mut sink: Vec<Sample> = Vec::new();
        let outcome = Session::new(transport)
            .collect(&config(1), &mut sink, &CancelToken::new(), |_| {})
            .unwrap();
        assert_eq!(outcome.skipped, 1);
        assert_eq!(sink, vec![Sample::new(2.0, 21.0, None)]);
    }

    #[test]
    fn accepted_samples_stay_within_margin() {
        let lines = [
            "1,30.0", "2,31.0", "3,29.5", "4,45.0", "5,32.0", "6,33.1", "7,-5.0", "8,34.0",
            "9,36.5", "10,37.0",
        ];
        let config = config(0);
        let (_, sink, _) = collect(&lines, &config);
        let filter = OutlierFilter::new(config.filter);
        for pair in sink.windows(2) {
            let prev = pair[0].temperature;
            assert!((pair[1].temperature - prev).abs() <= filter.margin(prev));
        }
        assert!(sink.len() >= 2);
    }

    #[test]
    fn cancel_stops_session_and_sends_stop() {
        let (transport, written) = MockTransport::lines(&["1,20.0", "2,20.1", "3,20.2"]);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let mut sink: Vec<Sample> = Vec::new();
        let outcome = Session::new(transport)
            .collect(&config(0), &mut sink, &cancel, |event| {
                if let Event::Accepted { count: 2, .. } = event {
                    trigger.cancel();
                }
            })
            .unwrap();
        assert_eq!(outcome.reason, Termination::UserCancelled);
        assert_eq!(outcome.accepted, 2);
        assert_eq!(written_text(&written), "/safeData\n/stop\n");
    }

    #[test]
    fn stream_failure_still_sends_stop() {
        let (transport, written) = MockTransport::new(vec![
            Step::Data(b"1,20.0\n".to_vec()),
            Step::Fail(ErrorKind::BrokenPipe),
        ]);
        let mut sink: Vec<Sample> = Vec::new();
        let result = Session::new(transport).collect(&config(5), &mut sink, &CancelToken::new(), |_| {});
        assert!(matches!(result, Err(LinkError::Io(_))));
        assert_eq!(sink.len(), 1);
        assert_eq!(written_text(&written), "/safeData: 5\n/stop\n");
    }

    #[test]
    fn reports_progress_milestones() {
        let lines: Vec<String> = (1..=10).map(|i| format!("{i},20.0")).collect();
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
        let (transport, _) = MockTransport::lines(&lines);
        let mut percents = Vec::new();
        Session::new(transport)
            .collect(&config(10), &mut Vec::<Sample>::new(), &CancelToken::new(), |event| {
                if let Event::Progress { percent, .. } = event {
                    percents.push(*percent);
                }
            })
            .unwrap();
        assert_eq!(percents, vec![20, 40, 60, 80, 100]);
    }

    #[test]
    fn milestones_catch_up_on_small_targets() {
        let mut m = Milestones::new(3, 5);
        assert_eq!(m.crossed(1), vec![20]);
        assert_eq!(m.crossed(2), vec![40, 60]);
        assert_eq!(m.crossed(3), vec![80, 100]);
        assert!(Milestones::new(0, 5).crossed(10).is_empty());
    }

    #[test]
    fn collect_rejects_invalid_config() {
        let (transport, written) = MockTransport::lines(&[]);
        let config = SessionConfig {
            empty_read_limit: 0,
            ..config(1)
        };
        let result = Session::new(transport).collect(&config, &mut Vec::<Sample>::new(), &CancelToken::new(), |_| {});
        assert!(matches!(result, Err(LinkError::InvalidConfig(_))));
        assert!(written_text(&written).is_empty());
    }

    #[test]
    fn monitor_forwards_lines_until_cancelled() {
        let (transport, written) = MockTransport::lines(&["1,20.0", "", "hello", "2,20.1"]);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let mut seen = Vec::new();
        let forwarded = Session::new(transport)
            .monitor(&config(0), &cancel, |event| {
                if let Event::Line(text) = event {
                    seen.push(text.to_string());
                    if seen.len() == 3 {
                        trigger.cancel();
                    }
                }
            })
            .unwrap();
        assert_eq!(forwarded, 3);
        assert_eq!(seen, vec!["1,20.0", "hello", "2,20.1"]);
        assert_eq!(written_text(&written), "/monitor\n/stop\n");
    }

    #[test]
    fn setpoint_collects_replies() {
        let (transport, written) = MockTransport::lines(&["0"]);
        let link = LinkConfig {
            ack_delay: Duration::ZERO,
            ..LinkConfig::default()
        };
        let mut session = Session::new(transport);
        let replies = session.set_setpoint(&link, 29.5).unwrap();
        assert_eq!(replies, vec!["0".to_string()]);
        assert_eq!(written_text(&written), "/set yr: 29.5\n");

        assert!(matches!(
            session.set_setpoint(&link, f64::NAN),
            Err(LinkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn setpoint_ignores_stale_input() {
        let (transport, written) = MockTransport::new(vec![
            Step::Stale(b"Time_ms, Voltage_V\r\n1200, 27.85\r\n".to_vec()),
            Step::Data(b"0\r\n".to_vec()),
        ]);
        let link = LinkConfig {
            ack_delay: Duration::ZERO,
            ..LinkConfig::default()
        };
        let replies = Session::new(transport).set_setpoint(&link, 30.0).unwrap();
        assert_eq!(replies, vec!["0".to_string()]);
        assert_eq!(written_text(&written), "/set yr: 30\n");
    }
}
