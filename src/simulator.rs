//! # Cable tester fixture simulator
//!
//! Emulates the tester firmware: it holds the simulated fixture state (which
//! cable is plugged in, the device-side calibration) and answers command
//! lines with the same frames the real board prints, including progress
//! and debug chatter. [`SimulatedTransport`] puts it behind the
//! [`Transport`] trait so the protocol driver runs unchanged against it.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::time::Duration;

use tracing::{debug, info};

use crate::calibration::Channel;
use crate::error::{ConnectError, TransportError};
use crate::measurement::{milliohms_from_adc, milliohms_to_ohms};
use crate::protocol::{Circuit, Command, RawFrame};
use crate::transport::Transport;

// Custom error types for command processing.
#[derive(Debug, PartialEq)]
pub enum CommandError {
    /// Blank line.
    Empty,
    /// The command name is not part of the firmware's command set.
    UnknownCommand(String),
}

/// A fault the simulator injects instead of answering a command.
#[derive(Debug, Clone, PartialEq)]
pub enum InjectedFault {
    /// Swallow the command; the host sees a timeout.
    Silent,
    /// Answer with `ERROR:<msg>`.
    DeviceError(String),
    /// Answer with an arbitrary line, e.g. a garbled frame.
    Raw(String),
}

/// The cable currently plugged into the fixture.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedCable {
    pub present: bool,
    /// TT, TS, SS, ST continuity bits.
    pub ts_pairs: [bool; 4],
    pub ts_fault: Option<String>,
    /// `[near][far]` pin continuity, pins 1..=3 at indices 0..=2.
    pub xlr_matrix: [[bool; 3]; 3],
    pub xlr_faults: Vec<String>,
    pub near_shell: bool,
    pub far_shell: bool,
    pub ts_adc: u16,
    pub pin2_adc: u16,
    pub pin3_adc: u16,
}

impl SimulatedCable {
    /// A healthy cable wired for both TS and XLR probing.
    pub fn good() -> Self {
        Self {
            present: true,
            ts_pairs: [true, false, true, false],
            ts_fault: None,
            xlr_matrix: [[true, false, false], [false, true, false], [false, false, true]],
            xlr_faults: Vec::new(),
            near_shell: true,
            far_shell: true,
            ts_adc: 65,
            pin2_adc: 65,
            pin3_adc: 68,
        }
    }

    pub fn absent() -> Self {
        Self {
            present: false,
            ts_pairs: [false; 4],
            ts_fault: Some("NO_CABLE".to_string()),
            xlr_matrix: [[false; 3]; 3],
            xlr_faults: vec!["NO_CABLE".to_string()],
            near_shell: false,
            far_shell: false,
            ts_adc: 1023,
            pin2_adc: 1023,
            pin3_adc: 1023,
        }
    }

    pub fn with_ts_fault(mut self, code: &str) -> Self {
        self.ts_fault = Some(code.to_string());
        match code {
            "REVERSED" => self.ts_pairs = [false, true, false, true],
            "CROSSED" | "SHORT" => self.ts_pairs = [true, true, true, true],
            "TIP_OPEN" => self.ts_pairs[0] = false,
            "SLEEVE_OPEN" => self.ts_pairs[2] = false,
            _ => {}
        }
        self
    }

    pub fn with_xlr_faults(mut self, codes: &[&str]) -> Self {
        self.xlr_faults = codes.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_shell(mut self, near: bool, far: bool) -> Self {
        self.near_shell = near;
        self.far_shell = far;
        self
    }

    pub fn with_ts_adc(mut self, adc: u16) -> Self {
        self.ts_adc = adc;
        self
    }

    pub fn with_pin_adc(mut self, pin2: u16, pin3: u16) -> Self {
        self.pin2_adc = pin2;
        self.pin3_adc = pin3;
        self
    }
}

// The main struct that holds the entire state of the simulated fixture.
#[derive(Debug, Clone)]
pub struct Simulator {
    pub unit_id: String,
    pub busy: bool,
    pub cable: SimulatedCable,
    /// ADC readings the zero-ohm reference cable produces, per channel.
    pub reference_adc: HashMap<Channel, u16>,
    /// Firmware-side pass limits in milliohms.
    pub ts_limit_milliohms: u32,
    pub xlr_limit_milliohms: u32,
    /// Emit debug lines ahead of every response.
    pub chatter: bool,
    device_cal: HashMap<Channel, u16>,
    faults: HashMap<&'static str, InjectedFault>,
}

impl Simulator {
    /// Creates a powered-up, uncalibrated fixture with a good cable inserted.
    pub fn new(unit_id: &str) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            busy: false,
            cable: SimulatedCable::good(),
            reference_adc: HashMap::from([
                (Channel::Ts, 60),
                (Channel::XlrPin2, 58),
                (Channel::XlrPin3, 62),
            ]),
            ts_limit_milliohms: 500,
            xlr_limit_milliohms: 200,
            chatter: false,
            device_cal: HashMap::new(),
            faults: HashMap::new(),
        }
    }

    /// Makes every future `command` misbehave until cleared.
    pub fn inject(&mut self, command: Command, fault: InjectedFault) {
        self.faults.insert(command.wire_name(), fault);
    }

    pub fn clear_fault(&mut self, command: Command) {
        self.faults.remove(command.wire_name());
    }

    pub fn device_calibration(&self, channel: Channel) -> Option<u16> {
        self.device_cal.get(&channel).copied()
    }

    /// Overwrites the board's stored zero, as a bench recalibration would.
    pub fn set_device_calibration(&mut self, channel: Channel, zero_adc: u16) {
        self.device_cal.insert(channel, zero_adc);
    }

    /// Power loss or USB re-open: the board reboots and forgets calibration.
    pub fn power_cycle(&mut self) {
        self.device_cal.clear();
        self.busy = false;
    }

    /// Processes a command line and returns the lines the board prints.
    pub fn process_command(&mut self, command_str: &str) -> Result<Vec<String>, CommandError> {
        let name = command_str.trim();
        if name.is_empty() {
            return Err(CommandError::Empty);
        }
        let command = Command::from_wire(name)
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;

        let mut lines = Vec::new();
        if self.chatter {
            lines.push(format!("DBG:cmd {name}"));
        }

        match self.faults.get(command.wire_name()) {
            Some(InjectedFault::Silent) => return Ok(Vec::new()),
            Some(InjectedFault::DeviceError(message)) => {
                lines.push(format!("ERROR:{message}"));
                return Ok(lines);
            }
            Some(InjectedFault::Raw(line)) => {
                lines.push(line.clone());
                return Ok(lines);
            }
            None => {}
        }

        lines.extend(self.execute_command(command));
        Ok(lines)
    }

    /// Like [`Simulator::process_command`], but rejections become the
    /// firmware's own error frame, as they would on the wire.
    pub fn respond(&mut self, command_str: &str) -> Vec<String> {
        match self.process_command(command_str) {
            Ok(lines) => lines,
            Err(CommandError::Empty) => Vec::new(),
            Err(CommandError::UnknownCommand(name)) => {
                vec![format!("ERROR:UNKNOWN_COMMAND:{name}")]
            }
        }
    }

    /// Executes a parsed command and returns the response lines.
    fn execute_command(&mut self, command: Command) -> Vec<String> {
        match command {
            Command::Identify => vec![format!("ID:{}", self.unit_id)],
            Command::GetStatus => {
                let state = if self.busy { "BUSY" } else { "READY" };
                vec![format!("STATUS:{state}")]
            }
            Command::Reset => {
                self.device_cal.clear();
                self.busy = false;
                vec!["OK:RESET".to_string()]
            }
            Command::Calibrate(circuit) => self.calibrate(circuit),
            Command::RunContinuity(Circuit::Ts) => vec![self.ts_continuity().encode()],
            Command::RunContinuity(Circuit::Xlr) => vec![self.xlr_continuity().encode()],
            Command::RunShellBond => vec![self.shell_bond().encode()],
            Command::RunResistance(circuit) => vec![self.resistance(circuit).encode()],
        }
    }

    fn calibrate(&mut self, circuit: Circuit) -> Vec<String> {
        let tag = match circuit {
            Circuit::Ts => "CAL",
            Circuit::Xlr => "XCAL",
        };
        let mut lines = vec![format!("{tag}:MEASURING...")];

        if !self.cable.present {
            match circuit {
                Circuit::Ts => lines.push("ERROR:NO_CABLE".to_string()),
                Circuit::Xlr => lines.push(
                    RawFrame::new(tag, "FAIL")
                        .with_field("P2ADC", self.cable.pin2_adc)
                        .with_field("P3ADC", self.cable.pin3_adc)
                        .with_flag("NO_CABLE")
                        .encode(),
                ),
            }
            return lines;
        }

        let mut frame = RawFrame::new(tag, "OK");
        for channel in circuit.channels() {
            let zero = self.reference_adc.get(channel).copied().unwrap_or(0);
            self.device_cal.insert(*channel, zero);
            let key = match channel {
                Channel::Ts => "ADC",
                Channel::XlrPin2 => "P2ADC",
                Channel::XlrPin3 => "P3ADC",
            };
            frame = frame.with_field(key, zero);
        }
        debug!(unit = %self.unit_id, %circuit, "simulated calibration captured");
        lines.push(frame.encode());
        lines
    }

    fn ts_continuity(&self) -> RawFrame {
        let status = if self.cable.ts_fault.is_none() { "PASS" } else { "FAIL" };
        let mut frame = RawFrame::new("RESULT", status);
        for (key, bit) in ["TT", "TS", "SS", "ST"].iter().zip(self.cable.ts_pairs) {
            frame = frame.with_field(key, u8::from(bit));
        }
        if let Some(code) = &self.cable.ts_fault {
            frame = frame.with_field("REASON", code);
        }
        frame
    }

    fn xlr_continuity(&self) -> RawFrame {
        let status = if self.cable.xlr_faults.is_empty() { "PASS" } else { "FAIL" };
        let mut frame = RawFrame::new("XCONT", status);
        for (near, row) in self.cable.xlr_matrix.iter().enumerate() {
            for (far, bit) in row.iter().enumerate() {
                frame = frame.with_field(&format!("P{}{}", near + 1, far + 1), u8::from(*bit));
            }
        }
        if !self.cable.xlr_faults.is_empty() {
            frame = frame.with_field("REASON", self.cable.xlr_faults.join(","));
        }
        frame
    }

    fn shell_bond(&self) -> RawFrame {
        let mut reasons = Vec::new();
        if !self.cable.near_shell {
            reasons.push("NEAR_SHELL_OPEN");
        }
        if !self.cable.far_shell {
            reasons.push("FAR_SHELL_OPEN");
        }
        let shell_to_shell = self.cable.near_shell && self.cable.far_shell;
        let status = if reasons.is_empty() { "PASS" } else { "FAIL" };

        let mut frame = RawFrame::new("XSHELL", status)
            .with_field("NEAR", u8::from(self.cable.near_shell))
            .with_field("FAR", u8::from(self.cable.far_shell))
            .with_field("SS", u8::from(shell_to_shell));
        if !reasons.is_empty() {
            frame = frame.with_field("REASON", reasons.join(","));
        }
        frame
    }

    fn resistance(&self, circuit: Circuit) -> RawFrame {
        match circuit {
            Circuit::Ts => {
                let adc = self.cable.ts_adc;
                match self.device_cal.get(&Channel::Ts) {
                    Some(&cal) => {
                        let mohm = milliohms_from_adc(adc, cal);
                        let status = if mohm <= self.ts_limit_milliohms { "PASS" } else { "FAIL" };
                        RawFrame::new("RES", status)
                            .with_field("ADC", adc)
                            .with_field("CAL", cal)
                            .with_field("MOHM", mohm)
                            .with_field("OHM", format!("{:.3}", milliohms_to_ohms(mohm)))
                    }
                    None => RawFrame::new("RES", "FAIL")
                        .with_field("ADC", adc)
                        .with_field("OHM", "UNCAL"),
                }
            }
            Circuit::Xlr => {
                let (p2, p3) = (self.cable.pin2_adc, self.cable.pin3_adc);
                let cal = (
                    self.device_cal.get(&Channel::XlrPin2).copied(),
                    self.device_cal.get(&Channel::XlrPin3).copied(),
                );
                match cal {
                    (Some(c2), Some(c3)) => {
                        let m2 = milliohms_from_adc(p2, c2);
                        let m3 = milliohms_from_adc(p3, c3);
                        let limit = self.xlr_limit_milliohms;
                        let status = if m2 <= limit && m3 <= limit { "PASS" } else { "FAIL" };
                        RawFrame::new("XRES", status)
                            .with_field("P2ADC", p2)
                            .with_field("P3ADC", p3)
                            .with_field("P2CAL", c2)
                            .with_field("P3CAL", c3)
                            .with_field("P2MOHM", m2)
                            .with_field("P2OHM", format!("{:.3}", milliohms_to_ohms(m2)))
                            .with_field("P3MOHM", m3)
                            .with_field("P3OHM", format!("{:.3}", milliohms_to_ohms(m3)))
                    }
                    _ => RawFrame::new("XRES", "FAIL")
                        .with_field("P2ADC", p2)
                        .with_field("P3ADC", p3)
                        .with_field("OHM", "UNCAL"),
                }
            }
        }
    }
}

/// Answers newline-terminated commands read from `port` until the port fails.
///
/// Read timeouts are the idle case. Any other read or write error ends the
/// loop and is returned.
pub fn serve<P: Read + Write + ?Sized>(port: &mut P, simulator: &mut Simulator) -> io::Result<()> {
    let mut pending: Vec<u8> = Vec::with_capacity(128);
    let mut serial_buf = [0u8; 128];
    loop {
        let bytes_read = match port.read(&mut serial_buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "port closed")),
            Ok(bytes_read) => bytes_read,
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {
                continue
            }
            Err(e) => return Err(e),
        };

        pending.extend_from_slice(&serial_buf[..bytes_read]);
        while let Some(end) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=end).collect();
            let command = String::from_utf8_lossy(&raw).trim().to_string();
            if command.is_empty() {
                continue;
            }
            info!(%command, "received");
            for line in simulator.respond(&command) {
                debug!(%line, "replying");
                port.write_all(format!("{line}\r\n").as_bytes())?;
            }
            port.flush()?;
        }
    }
}

/// [`Transport`] backed by an in-process [`Simulator`].
///
/// Reads never block: an empty outbox is reported as a timeout right away.
#[derive(Debug)]
pub struct SimulatedTransport {
    simulator: Simulator,
    outbox: VecDeque<String>,
    sent: Vec<String>,
    connected: bool,
}

impl SimulatedTransport {
    pub fn new(simulator: Simulator) -> Self {
        Self {
            simulator,
            outbox: VecDeque::new(),
            sent: Vec::new(),
            connected: true,
        }
    }

    pub fn simulator(&self) -> &Simulator {
        &self.simulator
    }

    /// Access to the fixture, e.g. to swap the inserted cable mid-session.
    pub fn simulator_mut(&mut self) -> &mut Simulator {
        &mut self.simulator
    }

    /// Every command line sent so far, in order.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    /// Simulates the USB cable being pulled.
    pub fn unplug(&mut self) {
        self.connected = false;
        self.outbox.clear();
    }
}

impl Transport for SimulatedTransport {
    fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        self.sent.push(line.to_string());
        let replies = self.simulator.respond(line);
        self.outbox.extend(replies);
        Ok(())
    }

    fn discard_input(&mut self) -> Vec<String> {
        self.outbox.drain(..).collect()
    }

    fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>, TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        Ok(self.outbox.pop_front())
    }

    fn reconnect(&mut self) -> Result<(), ConnectError> {
        self.outbox.clear();
        self.simulator.power_cycle();
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) {
        self.connected = false;
        self.outbox.clear();
    }

    fn describe(&self) -> String {
        format!("simulator:{}", self.simulator.unit_id)
    }
}
