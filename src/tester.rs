//! The tester as a capability: typed operations over one command exchange each.
//!
//! [`CableTester`] is what the orchestrator drives. [`ProtocolTester`]
//! implements it for any [`Transport`], so the serial hardware and the
//! in-process simulator share one codec.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::calibration::CalibrationRecord;
use crate::config::{CommandTimeouts, TesterConfig};
use crate::error::{ConnectError, TesterError};
use crate::fault::{classify_ts, classify_xlr};
use crate::protocol::{self, Circuit, Command, DeviceState, RawFrame, ResistanceFrame};
use crate::report::{ContinuityResult, PairName, ShellBondResult};
use crate::simulator::{SimulatedTransport, Simulator};
use crate::transport::{read_until_prefix, SerialSettings, SerialTransport, Transport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub connected: bool,
    pub port: String,
    pub tester_id: Option<String>,
    pub state: Option<DeviceState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalibrationOutcome {
    /// New zero references, one per channel of the circuit.
    Calibrated(Vec<CalibrationRecord>),
    /// The device refused, e.g. with no reference cable inserted.
    Rejected { reason: String },
}

pub trait CableTester {
    /// Identify handshake. Returns the unit id.
    fn identify(&mut self) -> Result<String, TesterError>;

    fn status(&mut self) -> Result<DeviceStatus, TesterError>;

    fn is_ready(&mut self) -> Result<bool, TesterError> {
        Ok(self.status()?.state == Some(DeviceState::Ready))
    }

    fn reset(&mut self) -> Result<(), TesterError>;

    fn calibrate(&mut self, circuit: Circuit) -> Result<CalibrationOutcome, TesterError>;

    fn run_continuity(&mut self, circuit: Circuit) -> Result<ContinuityResult, TesterError>;

    fn run_shell_bond(&mut self) -> Result<ShellBondResult, TesterError>;

    /// Raw readings; calibration is applied by the caller.
    fn run_resistance(&mut self, circuit: Circuit) -> Result<ResistanceFrame, TesterError>;

    fn reconnect(&mut self) -> Result<(), ConnectError>;

    fn close(&mut self);

    fn tester_id(&self) -> Option<&str>;
}

/// Speaks the line protocol over a [`Transport`].
#[derive(Debug)]
pub struct ProtocolTester<T: Transport> {
    transport: T,
    timeouts: CommandTimeouts,
    tester_id: Option<String>,
    connected: bool,
}

pub type SerialTester = ProtocolTester<SerialTransport>;
pub type SimulatedTester = ProtocolTester<SimulatedTransport>;

impl<T: Transport> ProtocolTester<T> {
    pub fn new(transport: T, timeouts: CommandTimeouts) -> Self {
        Self {
            transport,
            timeouts,
            tester_id: None,
            connected: true,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// One request/response round trip.
    fn exchange(&mut self, command: Command) -> Result<RawFrame, TesterError> {
        if !self.connected {
            return Err(TesterError::NotConnected);
        }
        let timeout = command.timeout(&self.timeouts);
        for stale in self.transport.discard_input() {
            debug!(%command, %stale, "discarding stale input");
        }
        debug!(%command, ?timeout, "sending command");
        self.transport.send_line(command.wire_name())?;
        let line = read_until_prefix(&mut self.transport, command, timeout)?;
        debug!(%command, response = %line, "received response");
        Ok(RawFrame::parse(&line)?)
    }
}

impl SerialTester {
    /// Opens the configured (or discovered) port and runs the identify handshake.
    pub fn open(config: &TesterConfig) -> Result<Self, ConnectError> {
        let settings = SerialSettings {
            baud_rate: config.baud_rate,
            timeout: config.read_timeout,
            settle_time: config.settle_time,
        };
        let transport = SerialTransport::connect(config.port.as_deref(), settings)?;
        let mut tester = ProtocolTester::new(transport, config.timeouts);
        tester.identify().map_err(|source| ConnectError::Handshake {
            port: tester.transport.describe(),
            source: Box::new(source),
        })?;
        Ok(tester)
    }
}

impl SimulatedTester {
    pub fn simulated(simulator: Simulator, timeouts: CommandTimeouts) -> Self {
        ProtocolTester::new(SimulatedTransport::new(simulator), timeouts)
    }
}

impl<T: Transport> CableTester for ProtocolTester<T> {
    fn identify(&mut self) -> Result<String, TesterError> {
        let frame = self.exchange(Command::Identify)?;
        let id = protocol::decode_identify(&frame)?;
        info!(tester_id = %id, port = %self.transport.describe(), "tester identified");
        self.tester_id = Some(id.clone());
        Ok(id)
    }

    fn status(&mut self) -> Result<DeviceStatus, TesterError> {
        let port = self.transport.describe();
        if !self.connected {
            return Ok(DeviceStatus {
                connected: false,
                port,
                tester_id: self.tester_id.clone(),
                state: None,
            });
        }
        let frame = self.exchange(Command::GetStatus)?;
        Ok(DeviceStatus {
            connected: true,
            port,
            tester_id: self.tester_id.clone(),
            state: Some(protocol::decode_status(&frame)?),
        })
    }

    fn reset(&mut self) -> Result<(), TesterError> {
        let frame = self.exchange(Command::Reset)?;
        protocol::decode_reset(&frame)?;
        info!("tester reset");
        Ok(())
    }

    #[instrument(skip(self))]
    fn calibrate(&mut self, circuit: Circuit) -> Result<CalibrationOutcome, TesterError> {
        let frame = self.exchange(Command::Calibrate(circuit))?;
        let decoded = protocol::decode_calibration(&frame, circuit)?;
        if !decoded.ok {
            return Ok(CalibrationOutcome::Rejected {
                reason: decoded.reason.unwrap_or_else(|| "UNKNOWN".to_string()),
            });
        }
        let records = decoded
            .zero_adc
            .into_iter()
            .map(|(channel, zero_adc)| CalibrationRecord::captured_now(channel, zero_adc))
            .collect();
        Ok(CalibrationOutcome::Calibrated(records))
    }

    fn run_continuity(&mut self, circuit: Circuit) -> Result<ContinuityResult, TesterError> {
        let frame = self.exchange(Command::RunContinuity(circuit))?;
        let decoded = protocol::decode_continuity(&frame, circuit)?;
        let reason = decoded.reason.as_deref();
        let mut reasons: Vec<_> = match circuit {
            Circuit::Ts => classify_ts(reason).into_iter().collect(),
            Circuit::Xlr => classify_xlr(reason),
        };
        if decoded.passed {
            // A passing frame never carries a fault.
            reasons.clear();
        }
        Ok(ContinuityResult {
            passed: decoded.passed,
            pair_states: decoded.pairs.into_iter().collect(),
            reasons,
        })
    }

    fn run_shell_bond(&mut self) -> Result<ShellBondResult, TesterError> {
        let frame = self.exchange(Command::RunShellBond)?;
        let decoded = protocol::decode_shell_bond(&frame)?;
        let pair_states = BTreeMap::from([
            (PairName::NearShell, decoded.near_bond),
            (PairName::FarShell, decoded.far_bond),
            (PairName::ShellShell, decoded.shell_to_shell),
        ]);
        let reasons = if decoded.passed {
            Vec::new()
        } else {
            classify_xlr(decoded.reason.as_deref())
        };
        Ok(ShellBondResult {
            passed: decoded.passed,
            pair_states,
            reasons,
        })
    }

    fn run_resistance(&mut self, circuit: Circuit) -> Result<ResistanceFrame, TesterError> {
        let frame = self.exchange(Command::RunResistance(circuit))?;
        Ok(protocol::decode_resistance(&frame, circuit)?)
    }

    fn reconnect(&mut self) -> Result<(), ConnectError> {
        info!(port = %self.transport.describe(), "reconnecting to tester");
        self.connected = false;
        self.transport.reconnect()?;
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) {
        if self.connected {
            self.transport.close();
            self.connected = false;
            info!(port = %self.transport.describe(), "connection closed");
        }
    }

    fn tester_id(&self) -> Option<&str> {
        self.tester_id.as_deref()
    }
}
