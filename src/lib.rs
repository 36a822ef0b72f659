//! # Cable Tester Library
//!
//! Host-side engine for a serial continuity/resistance fixture that checks
//! finished TS and XLR cables. It speaks the fixture's line protocol, keeps
//! per-channel zero-ohm calibration, converts raw ADC readings to milliohms,
//! classifies wiring faults and sequences a full test into a [`TestReport`].
//!
//! A deterministic fixture [`Simulator`] implements the same transport as
//! the serial link, so every layer above it runs without hardware.

pub mod calibration;
pub mod config;
pub mod error;
pub mod fault;
pub mod measurement;
pub mod orchestrator;
pub mod product;
pub mod protocol;
pub mod report;
pub mod report_store;
pub mod simulator;
pub mod tester;
pub mod transport;

pub use calibration::{CalibrationRecord, CalibrationStore, Channel};
pub use config::{CommandTimeouts, ResistanceLimits, TesterConfig};
pub use error::{ConnectError, ParseError, RunError, TesterError, TransportError};
pub use fault::FaultReason;
pub use orchestrator::{ConfirmationGate, Prompt, RunState, TestOrchestrator};
pub use product::{ProductProfile, ProductSeries};
pub use protocol::{Circuit, Command, RawFrame};
pub use report::{StepOutcome, TestReport, Topology};
pub use report_store::{JsonLinesReportStore, ReportStore};
pub use simulator::{SimulatedCable, SimulatedTransport, Simulator};
pub use tester::{CableTester, ProtocolTester, SerialTester, SimulatedTester};
pub use transport::{SerialTransport, Transport};
