//! Wire protocol spoken by the tester firmware.
//!
//! Every exchange is one ASCII command line answered by one or more
//! colon-delimited frames, e.g. `RESULT:PASS:TT:1:TS:0:SS:1:ST:0`. The first
//! token is the frame tag, the second is positional (pass/fail, unit id,
//! device state), and the rest are `KEY:VALUE` pairs in no guaranteed order.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::calibration::Channel;
use crate::config::CommandTimeouts;
use crate::error::ParseError;
use crate::report::PairName;

/// The connector family a command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Circuit {
    Ts,
    Xlr,
}

impl Circuit {
    /// Calibration channels measured by this circuit.
    pub fn channels(self) -> &'static [Channel] {
        match self {
            Circuit::Ts => &[Channel::Ts],
            Circuit::Xlr => &[Channel::XlrPin2, Channel::XlrPin3],
        }
    }
}

impl fmt::Display for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Circuit::Ts => f.write_str("TS"),
            Circuit::Xlr => f.write_str("XLR"),
        }
    }
}

/// A request to the tester. Built per call; carries no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Identify,
    GetStatus,
    Reset,
    Calibrate(Circuit),
    RunContinuity(Circuit),
    RunResistance(Circuit),
    RunShellBond,
}

impl Command {
    /// The line sent on the wire, without terminator.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Command::Identify => "ID",
            Command::GetStatus => "STATUS",
            Command::Reset => "RESET",
            Command::Calibrate(Circuit::Ts) => "CAL",
            Command::Calibrate(Circuit::Xlr) => "XCAL",
            Command::RunContinuity(Circuit::Ts) => "CONT",
            Command::RunContinuity(Circuit::Xlr) => "XCONT",
            Command::RunResistance(Circuit::Ts) => "RES",
            Command::RunResistance(Circuit::Xlr) => "XRES",
            Command::RunShellBond => "XSHELL",
        }
    }

    /// Line prefixes that terminate the exchange for this command.
    ///
    /// `CAL:MEASURING...` progress lines do not match and are skipped.
    pub fn response_prefixes(&self) -> &'static [&'static str] {
        match self {
            Command::Identify => &["ID:"],
            Command::GetStatus => &["STATUS:"],
            Command::Reset => &["OK:"],
            Command::Calibrate(Circuit::Ts) => &["CAL:OK", "CAL:FAIL"],
            Command::Calibrate(Circuit::Xlr) => &["XCAL:OK", "XCAL:FAIL"],
            Command::RunContinuity(Circuit::Ts) => &["RESULT:"],
            Command::RunContinuity(Circuit::Xlr) => &["XCONT:"],
            Command::RunResistance(Circuit::Ts) => &["RES:"],
            Command::RunResistance(Circuit::Xlr) => &["XRES:"],
            Command::RunShellBond => &["XSHELL:"],
        }
    }

    pub fn timeout(&self, timeouts: &CommandTimeouts) -> Duration {
        match self {
            Command::Identify | Command::GetStatus | Command::Reset => timeouts.control,
            Command::Calibrate(_) => timeouts.calibration,
            Command::RunContinuity(_) | Command::RunResistance(_) | Command::RunShellBond => {
                timeouts.measurement
            }
        }
    }

    /// Parses a wire command name back into a `Command`.
    pub fn from_wire(name: &str) -> Option<Command> {
        let command = match name {
            "ID" => Command::Identify,
            "STATUS" => Command::GetStatus,
            "RESET" => Command::Reset,
            "CAL" => Command::Calibrate(Circuit::Ts),
            "XCAL" => Command::Calibrate(Circuit::Xlr),
            "CONT" => Command::RunContinuity(Circuit::Ts),
            "XCONT" => Command::RunContinuity(Circuit::Xlr),
            "RES" => Command::RunResistance(Circuit::Ts),
            "XRES" => Command::RunResistance(Circuit::Xlr),
            "XSHELL" => Command::RunShellBond,
            _ => return None,
        };
        Some(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// One decoded wire line as an ordered list of tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    tokens: Vec<String>,
}

impl RawFrame {
    /// Starts a frame with its tag and positional status token.
    pub fn new(tag: &str, status: impl Into<String>) -> Self {
        Self {
            tokens: vec![tag.to_string(), status.into()],
        }
    }

    pub fn with_field(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.tokens.push(key.to_string());
        self.tokens.push(value.to_string());
        self
    }

    /// Appends an unpaired trailing token such as `NO_CABLE`.
    pub fn with_flag(mut self, flag: &str) -> Self {
        self.tokens.push(flag.to_string());
        self
    }

    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let tokens: Vec<String> = line.split(':').map(str::to_string).collect();
        let tag = &tokens[0];
        let tag_ok = !tag.is_empty()
            && tag
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if !tag_ok {
            return Err(ParseError::MalformedFrame(line.to_string()));
        }

        Ok(Self { tokens })
    }

    pub fn encode(&self) -> String {
        self.tokens.join(":")
    }

    pub fn tag(&self) -> &str {
        &self.tokens[0]
    }

    pub fn status(&self) -> Option<&str> {
        self.tokens.get(1).map(String::as_str)
    }

    /// Everything after the tag, colons included. Used for `ERROR:` text.
    pub fn message(&self) -> String {
        self.tokens[1..].join(":")
    }

    fn pair_tokens(&self) -> &[String] {
        if self.tokens.len() > 2 {
            &self.tokens[2..]
        } else {
            &[]
        }
    }

    /// Key/value pairs after the status token, in wire order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pair_tokens()
            .chunks_exact(2)
            .map(|pair| (pair[0].as_str(), pair[1].as_str()))
    }

    /// An odd token left over after the key/value pairs.
    pub fn trailing(&self) -> Option<&str> {
        self.pair_tokens()
            .chunks_exact(2)
            .remainder()
            .first()
            .map(String::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn str_field(&self, key: &str) -> Result<&str, ParseError> {
        self.field(key)
            .ok_or_else(|| ParseError::MissingField(key.to_string()))
    }

    pub fn int_field<T: FromStr>(&self, key: &str) -> Result<T, ParseError> {
        let value = self.str_field(key)?;
        value.parse().map_err(|_| ParseError::TypeMismatch {
            field: key.to_string(),
            value: value.to_string(),
            expected: "integer",
        })
    }

    /// Integer field that may be absent; present-but-garbled is still an error.
    pub fn opt_int_field<T: FromStr>(&self, key: &str) -> Result<Option<T>, ParseError> {
        match self.field(key) {
            None => Ok(None),
            Some(_) => self.int_field(key).map(Some),
        }
    }

    pub fn bool_field(&self, key: &str) -> Result<bool, ParseError> {
        match self.str_field(key)? {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(ParseError::TypeMismatch {
                field: key.to_string(),
                value: other.to_string(),
                expected: "0 or 1",
            }),
        }
    }

    pub fn expect_tag(&self, expected: &'static str) -> Result<(), ParseError> {
        if self.tag() == expected {
            Ok(())
        } else {
            Err(ParseError::UnexpectedTag {
                expected,
                found: self.tag().to_string(),
            })
        }
    }

    /// Reads the positional pass/fail token. `OK` counts as a pass.
    pub fn passed(&self) -> Result<bool, ParseError> {
        match self.status() {
            Some("PASS") | Some("OK") => Ok(true),
            Some("FAIL") => Ok(false),
            Some(other) => Err(ParseError::TypeMismatch {
                field: "status".to_string(),
                value: other.to_string(),
                expected: "PASS, FAIL or OK",
            }),
            None => Err(ParseError::MissingField("status".to_string())),
        }
    }
}

impl fmt::Display for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for RawFrame {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RawFrame::parse(s)
    }
}

/// Device state reported by `STATUS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DeviceState {
    Ready,
    Busy,
    Other(String),
}

pub fn decode_identify(frame: &RawFrame) -> Result<String, ParseError> {
    frame.expect_tag("ID")?;
    match frame.status() {
        Some(id) if !id.is_empty() => Ok(frame.message()),
        _ => Err(ParseError::MissingField("unit id".to_string())),
    }
}

pub fn decode_status(frame: &RawFrame) -> Result<DeviceState, ParseError> {
    frame.expect_tag("STATUS")?;
    match frame.status() {
        Some("READY") => Ok(DeviceState::Ready),
        Some("BUSY") => Ok(DeviceState::Busy),
        Some(other) => Ok(DeviceState::Other(other.to_string())),
        None => Err(ParseError::MissingField("status".to_string())),
    }
}

pub fn decode_reset(frame: &RawFrame) -> Result<(), ParseError> {
    frame.expect_tag("OK")?;
    match frame.status() {
        Some("RESET") => Ok(()),
        Some(other) => Err(ParseError::TypeMismatch {
            field: "status".to_string(),
            value: other.to_string(),
            expected: "RESET",
        }),
        None => Err(ParseError::MissingField("status".to_string())),
    }
}

/// Continuity frame before fault classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuityFrame {
    pub passed: bool,
    pub pairs: Vec<(PairName, bool)>,
    pub reason: Option<String>,
}

const TS_PAIRS: [(&str, PairName); 4] = [
    ("TT", PairName::TipTip),
    ("TS", PairName::TipSleeve),
    ("SS", PairName::SleeveSleeve),
    ("ST", PairName::SleeveTip),
];

pub fn decode_continuity(frame: &RawFrame, circuit: Circuit) -> Result<ContinuityFrame, ParseError> {
    let mut pairs = Vec::new();
    match circuit {
        Circuit::Ts => {
            frame.expect_tag("RESULT")?;
            for (key, pair) in TS_PAIRS {
                pairs.push((pair, frame.bool_field(key)?));
            }
        }
        Circuit::Xlr => {
            frame.expect_tag("XCONT")?;
            for near in 1..=3u8 {
                for far in 1..=3u8 {
                    let key = format!("P{near}{far}");
                    pairs.push((PairName::Pin { near, far }, frame.bool_field(&key)?));
                }
            }
        }
    }

    Ok(ContinuityFrame {
        passed: frame.passed()?,
        pairs,
        reason: frame.field("REASON").map(str::to_string),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellBondFrame {
    pub passed: bool,
    pub near_bond: bool,
    pub far_bond: bool,
    pub shell_to_shell: bool,
    pub reason: Option<String>,
}

pub fn decode_shell_bond(frame: &RawFrame) -> Result<ShellBondFrame, ParseError> {
    frame.expect_tag("XSHELL")?;
    Ok(ShellBondFrame {
        passed: frame.passed()?,
        near_bond: frame.bool_field("NEAR")?,
        far_bond: frame.bool_field("FAR")?,
        shell_to_shell: frame.bool_field("SS")?,
        reason: frame.field("REASON").map(str::to_string),
    })
}

/// One channel's reading out of a resistance frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinReading {
    pub channel: Channel,
    pub raw_adc: u16,
    /// Zero reference the device used; `None` means the device is uncalibrated.
    pub device_cal: Option<u16>,
    pub device_milliohms: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResistanceFrame {
    pub passed: bool,
    pub readings: Vec<PinReading>,
}

impl ResistanceFrame {
    /// True when every channel carries the device's calibration fields.
    pub fn is_calibrated(&self) -> bool {
        self.readings.iter().all(|r| r.device_cal.is_some())
    }
}

fn pin_reading(
    frame: &RawFrame,
    channel: Channel,
    adc_key: &str,
    cal_key: &str,
    mohm_key: &str,
) -> Result<PinReading, ParseError> {
    Ok(PinReading {
        channel,
        raw_adc: frame.int_field(adc_key)?,
        device_cal: frame.opt_int_field(cal_key)?,
        device_milliohms: frame.opt_int_field(mohm_key)?,
    })
}

pub fn decode_resistance(frame: &RawFrame, circuit: Circuit) -> Result<ResistanceFrame, ParseError> {
    let readings = match circuit {
        Circuit::Ts => {
            frame.expect_tag("RES")?;
            vec![pin_reading(frame, Channel::Ts, "ADC", "CAL", "MOHM")?]
        }
        Circuit::Xlr => {
            frame.expect_tag("XRES")?;
            vec![
                pin_reading(frame, Channel::XlrPin2, "P2ADC", "P2CAL", "P2MOHM")?,
                pin_reading(frame, Channel::XlrPin3, "P3ADC", "P3CAL", "P3MOHM")?,
            ]
        }
    };

    Ok(ResistanceFrame {
        passed: frame.passed()?,
        readings,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationFrame {
    pub ok: bool,
    pub zero_adc: Vec<(Channel, u16)>,
    /// Failure code when the device rejected the calibration, e.g. `NO_CABLE`.
    pub reason: Option<String>,
}

pub fn decode_calibration(frame: &RawFrame, circuit: Circuit) -> Result<CalibrationFrame, ParseError> {
    const TS_KEYS: &[(Channel, &str)] = &[(Channel::Ts, "ADC")];
    const XLR_KEYS: &[(Channel, &str)] = &[(Channel::XlrPin2, "P2ADC"), (Channel::XlrPin3, "P3ADC")];

    let (tag, keys) = match circuit {
        Circuit::Ts => ("CAL", TS_KEYS),
        Circuit::Xlr => ("XCAL", XLR_KEYS),
    };
    frame.expect_tag(tag)?;
    let ok = frame.passed()?;

    let mut zero_adc = Vec::new();
    for (channel, key) in keys {
        if ok {
            zero_adc.push((*channel, frame.int_field(key)?));
        } else if let Some(value) = frame.opt_int_field(key)? {
            zero_adc.push((*channel, value));
        }
    }

    let reason = if ok {
        None
    } else {
        Some(
            frame
                .trailing()
                .or_else(|| frame.field("REASON"))
                .unwrap_or("UNKNOWN")
                .to_string(),
        )
    };

    Ok(CalibrationFrame { ok, zero_adc, reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_tag_status_and_fields() {
        let frame = RawFrame::parse("RESULT:PASS:TT:1:TS:0:SS:1:ST:0\r\n").unwrap();
        assert_eq!(frame.tag(), "RESULT");
        assert_eq!(frame.status(), Some("PASS"));
        assert_eq!(frame.field("SS"), Some("1"));
        assert_eq!(frame.fields().count(), 4);
        assert_eq!(frame.trailing(), None);
    }

    #[test]
    fn fields_are_found_regardless_of_order() {
        let frame = RawFrame::parse("RES:PASS:MOHM:50:CAL:820:ADC:800").unwrap();
        assert_eq!(frame.int_field::<u16>("ADC").unwrap(), 800);
        assert_eq!(frame.int_field::<u16>("CAL").unwrap(), 820);
    }

    #[test]
    fn reject_empty_and_malformed_lines() {
        assert_eq!(RawFrame::parse("").unwrap_err(), ParseError::Empty);
        assert_eq!(RawFrame::parse("  \r\n").unwrap_err(), ParseError::Empty);
        assert!(matches!(
            RawFrame::parse(":PASS").unwrap_err(),
            ParseError::MalformedFrame(_)
        ));
        assert!(matches!(
            RawFrame::parse("Relay bank 2 settled").unwrap_err(),
            ParseError::MalformedFrame(_)
        ));
    }

    #[test]
    fn missing_and_mistyped_fields_are_typed_errors() {
        let frame = RawFrame::parse("RES:PASS:ADC:eight").unwrap();
        assert_eq!(
            frame.str_field("CAL").unwrap_err(),
            ParseError::MissingField("CAL".to_string())
        );
        assert!(matches!(
            frame.int_field::<u16>("ADC").unwrap_err(),
            ParseError::TypeMismatch { .. }
        ));

        let frame = RawFrame::parse("RESULT:PASS:TT:2").unwrap();
        assert!(matches!(
            frame.bool_field("TT").unwrap_err(),
            ParseError::TypeMismatch { .. }
        ));
    }

    #[test]
    fn error_message_keeps_embedded_colons() {
        let frame = RawFrame::parse("ERROR:relay fault: bank 2").unwrap();
        assert_eq!(frame.tag(), "ERROR");
        assert_eq!(frame.message(), "relay fault: bank 2");
    }

    #[test]
    fn encode_then_parse_is_identity() {
        let lines = [
            "ID:GL-TESTER-02",
            "STATUS:READY",
            "OK:RESET",
            "RESULT:FAIL:TT:0:TS:0:SS:0:ST:0:REASON:NO_CABLE",
            "RES:PASS:ADC:800:CAL:820:MOHM:50:OHM:0.050",
            "XCAL:FAIL:P2ADC:1:P3ADC:2:NO_CABLE",
        ];
        for line in lines {
            let frame = RawFrame::parse(line).unwrap();
            assert_eq!(frame.encode(), line);
            assert_eq!(RawFrame::parse(&frame.encode()).unwrap(), frame);
        }

        let built = RawFrame::new("CAL", "OK").with_field("ADC", 60);
        assert_eq!(RawFrame::parse(&built.encode()).unwrap(), built);
    }

    #[test]
    fn command_names_round_trip() {
        let commands = [
            Command::Identify,
            Command::GetStatus,
            Command::Reset,
            Command::Calibrate(Circuit::Ts),
            Command::Calibrate(Circuit::Xlr),
            Command::RunContinuity(Circuit::Ts),
            Command::RunContinuity(Circuit::Xlr),
            Command::RunResistance(Circuit::Ts),
            Command::RunResistance(Circuit::Xlr),
            Command::RunShellBond,
        ];
        for command in commands {
            assert_eq!(Command::from_wire(command.wire_name()), Some(command));
        }
        assert_eq!(Command::from_wire("TEST_CABLE"), None);
    }

    #[test]
    fn command_timeouts_follow_command_class() {
        let timeouts = CommandTimeouts::default();
        assert_eq!(Command::Identify.timeout(&timeouts), Duration::from_secs(5));
        assert_eq!(
            Command::Calibrate(Circuit::Xlr).timeout(&timeouts),
            Duration::from_secs(15)
        );
        assert_eq!(Command::RunShellBond.timeout(&timeouts), Duration::from_secs(10));
    }

    #[test]
    fn decode_ts_continuity_with_reason() {
        let frame = RawFrame::parse("RESULT:FAIL:TT:0:TS:1:SS:0:ST:1:REASON:REVERSED").unwrap();
        let decoded = decode_continuity(&frame, Circuit::Ts).unwrap();
        assert!(!decoded.passed);
        assert_eq!(decoded.reason.as_deref(), Some("REVERSED"));
        assert!(decoded.pairs.contains(&(PairName::TipSleeve, true)));
        assert!(decoded.pairs.contains(&(PairName::TipTip, false)));
    }

    #[test]
    fn decode_xlr_continuity_matrix() {
        let frame = RawFrame::parse(
            "XCONT:PASS:P11:1:P12:0:P13:0:P21:0:P22:1:P23:0:P31:0:P32:0:P33:1",
        )
        .unwrap();
        let decoded = decode_continuity(&frame, Circuit::Xlr).unwrap();
        assert!(decoded.passed);
        assert_eq!(decoded.pairs.len(), 9);
        assert!(decoded.pairs.contains(&(PairName::Pin { near: 2, far: 2 }, true)));
        assert!(decoded.pairs.contains(&(PairName::Pin { near: 2, far: 3 }, false)));
    }

    #[test]
    fn decode_continuity_rejects_wrong_tag() {
        let frame = RawFrame::parse("RES:PASS:ADC:1").unwrap();
        assert!(matches!(
            decode_continuity(&frame, Circuit::Ts).unwrap_err(),
            ParseError::UnexpectedTag { expected: "RESULT", .. }
        ));
    }

    #[test]
    fn resistance_without_cal_is_uncalibrated_not_zero() {
        let frame = RawFrame::parse("RES:FAIL:ADC:812:OHM:UNCAL").unwrap();
        let decoded = decode_resistance(&frame, Circuit::Ts).unwrap();
        assert!(!decoded.is_calibrated());
        assert_eq!(decoded.readings[0].raw_adc, 812);
        assert_eq!(decoded.readings[0].device_cal, None);

        let frame = RawFrame::parse("RES:PASS:ADC:800:CAL:0:MOHM:50:OHM:0.050").unwrap();
        let decoded = decode_resistance(&frame, Circuit::Ts).unwrap();
        assert!(decoded.is_calibrated());
        assert_eq!(decoded.readings[0].device_cal, Some(0));
    }

    #[test]
    fn decode_xlr_resistance_per_pin() {
        let frame = RawFrame::parse(
            "XRES:PASS:P2ADC:65:P3ADC:68:P2CAL:58:P3CAL:62:P2MOHM:50:P2OHM:0.050:P3MOHM:60:P3OHM:0.060",
        )
        .unwrap();
        let decoded = decode_resistance(&frame, Circuit::Xlr).unwrap();
        assert!(decoded.is_calibrated());
        assert_eq!(decoded.readings[1].channel, Channel::XlrPin3);
        assert_eq!(decoded.readings[1].raw_adc, 68);
        assert_eq!(decoded.readings[1].device_cal, Some(62));
    }

    #[test]
    fn decode_xlr_calibration_failure_flag() {
        let frame = RawFrame::parse("XCAL:FAIL:P2ADC:1020:P3ADC:1021:NO_CABLE").unwrap();
        let decoded = decode_calibration(&frame, Circuit::Xlr).unwrap();
        assert!(!decoded.ok);
        assert_eq!(decoded.reason.as_deref(), Some("NO_CABLE"));
        assert_eq!(decoded.zero_adc.len(), 2);

        let frame = RawFrame::parse("CAL:OK:ADC:60").unwrap();
        let decoded = decode_calibration(&frame, Circuit::Ts).unwrap();
        assert!(decoded.ok);
        assert_eq!(decoded.zero_adc, vec![(Channel::Ts, 60)]);
    }

    #[test]
    fn decode_control_frames() {
        let id = RawFrame::parse("ID:GL-TESTER-02").unwrap();
        assert_eq!(decode_identify(&id).unwrap(), "GL-TESTER-02");
        let busy = RawFrame::parse("STATUS:BUSY").unwrap();
        assert_eq!(decode_status(&busy).unwrap(), DeviceState::Busy);
        let reset = RawFrame::parse("OK:RESET").unwrap();
        assert!(decode_reset(&reset).is_ok());
    }
}
