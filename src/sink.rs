//! CSV persistence of accepted samples.
//!
//! Files have no header row and two or three columns per row:
//! `tick,temperature[,control]`.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use log::{debug, warn};

use crate::errors::{LinkError, Result};
use crate::protocol::Sample;

/// Destination for accepted samples.
pub trait SampleSink {
    fn append(&mut self, sample: &Sample) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl SampleSink for Vec<Sample> {
    fn append(&mut self, sample: &Sample) -> Result<()> {
        self.push(*sample);
        Ok(())
    }
}

/// Writes one CSV row per appended sample.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    rows: u64,
}

impl CsvSink<File> {
    /// Create (or truncate) a CSV file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        debug!("writing samples to {}", path.as_ref().display());
        Ok(Self::from_writer(file))
    }
}

impl<W: Write> CsvSink<W> {
    pub fn from_writer(inner: W) -> Self {
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(inner);
        Self { writer, rows: 0 }
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Flush and hand back the underlying writer.
    #[cfg(test)]
    fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| LinkError::Io(io::Error::new(e.error().kind(), e.error().to_string())))
    }
}

impl<W: Write> SampleSink for CsvSink<W> {
    fn append(&mut self, sample: &Sample) -> Result<()> {
        match sample.control {
            Some(control) => self
                .writer
                .serialize((sample.tick, sample.temperature, control))?,
            None => self.writer.serialize((sample.tick, sample.temperature))?,
        }
        self.rows += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Read back samples from any CSV source, skipping rows that do not parse.
pub fn read_samples_from<R: Read>(source: R) -> Result<Vec<Sample>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(source);

    let mut samples = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!("skipping unreadable row {}: {e}", row + 1);
                continue;
            }
        };
        match Sample::from_fields(record.iter()) {
            Ok(sample) => samples.push(sample),
            Err(e) => debug!("skipping row {}: {e}", row + 1),
        }
    }
    Ok(samples)
}

/// Read back samples from a CSV file written by a collection run.
pub fn read_samples<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => LinkError::FileNotFound(path.to_path_buf()),
        _ => LinkError::Io(e),
    })?;
    read_samples_from(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("pidlog-sink-{}-{name}", std::process::id()))
    }

    #[test]
    fn writes_rows_without_header() {
        let mut sink = CsvSink::from_writer(Vec::new());
        sink.append(&Sample::new(1.0, 20.0, None)).unwrap();
        sink.append(&Sample::new(2.0, 20.25, Some(400.0))).unwrap();
        assert_eq!(sink.rows(), 2);

        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].split(',').count(), 2);
        assert_eq!(lines[1].split(',').count(), 3);
    }

    #[test]
    fn file_read_back_matches_written_samples() {
        let path = temp_path("roundtrip.csv");
        let written = vec![
            Sample::new(100.0, 27.5, Some(812.0)),
            Sample::new(200.0, 27.61, None),
            Sample::new(300.0, -3.75, Some(0.0)),
        ];

        let mut sink = CsvSink::create(&path).unwrap();
        for sample in &written {
            sink.append(sample).unwrap();
        }
        sink.flush().unwrap();
        drop(sink);

        assert_eq!(read_samples(&path).unwrap(), written);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn skips_malformed_rows() {
        let data = "Time_ms, Voltage_V\n1, 20.0\n\nabc\n2,20.1,5\n3,x\n";
        let samples = read_samples_from(data.as_bytes()).unwrap();
        assert_eq!(
            samples,
            vec![
                Sample::new(1.0, 20.0, None),
                Sample::new(2.0, 20.1, Some(5.0))
            ]
        );
    }

    #[test]
    fn missing_file_is_reported() {
        let path = temp_path("does-not-exist.csv");
        assert!(matches!(
            read_samples(&path),
            Err(LinkError::FileNotFound(p)) if p == path
        ));
    }
}
