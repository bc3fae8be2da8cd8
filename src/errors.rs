use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("cannot open serial port {port}: {source}")]
    StreamUnavailable {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("file not found: {} (collect some samples first)", .0.display())]
    FileNotFound(PathBuf),
    #[error("plot error: {0}")]
    Plot(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Why a single record was dropped. Never fatal to a session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("record is not valid UTF-8")]
    Decode,
    #[error("expected at least 2 fields, got {0}")]
    TooFewFields(usize),
    #[error("expected at most 3 fields, got {0}")]
    TooManyFields(usize),
    #[error("field {index} is not numeric: {value:?}")]
    NotNumeric { index: usize, value: String },
}

pub type Result<T> = std::result::Result<T, LinkError>;
