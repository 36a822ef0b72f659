//! Error types for every layer of the tester stack.
//!
//! Connection and transport problems, malformed frames and device-reported
//! errors are all typed values. Cable faults are not errors; they travel as
//! [`FaultReason`](crate::fault::FaultReason) data inside test results.

use std::time::Duration;

use crate::protocol::Command;

/// Failure to establish a session with a tester.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// No serial device matched the known-tester heuristic.
    #[error("no cable tester found on any serial port")]
    NoDeviceFound,

    #[error("could not enumerate serial ports: {0}")]
    Enumerate(#[source] serialport::Error),

    #[error("failed to open {port}: {source}")]
    OpenFailed {
        port: String,
        #[source]
        source: serialport::Error,
    },

    /// The port opened but the device did not answer the identify handshake.
    #[error("device on {port} did not identify itself: {source}")]
    Handshake {
        port: String,
        #[source]
        source: Box<TesterError>,
    },
}

/// Line-level I/O failure on an open connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("tester disconnected")]
    Disconnected,

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// A wire line that does not decode into the frame the caller expected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty frame")]
    Empty,

    #[error("malformed frame: {0:?}")]
    MalformedFrame(String),

    #[error("expected a {expected} frame, got {found}")]
    UnexpectedTag { expected: &'static str, found: String },

    #[error("frame is missing field {0}")]
    MissingField(String),

    #[error("field {field} has value {value:?}, expected {expected}")]
    TypeMismatch {
        field: String,
        value: String,
        expected: &'static str,
    },
}

/// Failure of a single command exchange with the tester.
#[derive(Debug, thiserror::Error)]
pub enum TesterError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    #[error("no response to {command} within {timeout:?}")]
    NoResponse { command: Command, timeout: Duration },

    /// The device answered with an `ERROR:<msg>` frame.
    #[error("tester reported error: {0}")]
    Device(String),

    #[error("tester is not connected")]
    NotConnected,
}

/// Conditions that abort a whole test run without producing a report.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("test run cancelled by operator")]
    Cancelled,

    #[error("calibration failed: {0}")]
    CalibrationFailed(String),

    #[error("calibration aborted: {0}")]
    Calibration(#[from] TesterError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("report store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProductError {
    #[error("unknown product series in SKU {0:?}")]
    UnknownSeries(String),

    #[error("connector type {0:?} cannot be tested on this fixture")]
    UnsupportedConnector(String),
}
