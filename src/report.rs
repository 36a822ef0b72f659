//! Result types produced by a test run.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::calibration::{CalibrationRecord, Channel};
use crate::fault::FaultReason;
use crate::measurement::milliohms_to_ohms;
use crate::product::ProductSeries;
use crate::protocol::Circuit;

/// Connector family under test. Same set as the command circuits.
pub type Topology = Circuit;

/// A conductor pair probed by a continuity test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PairName {
    TipTip,
    TipSleeve,
    SleeveSleeve,
    SleeveTip,
    /// XLR matrix cell: near-end pin to far-end pin.
    Pin { near: u8, far: u8 },
    NearShell,
    FarShell,
    ShellShell,
}

impl fmt::Display for PairName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairName::TipTip => f.write_str("tip-tip"),
            PairName::TipSleeve => f.write_str("tip-sleeve"),
            PairName::SleeveSleeve => f.write_str("sleeve-sleeve"),
            PairName::SleeveTip => f.write_str("sleeve-tip"),
            PairName::Pin { near, far } => write!(f, "pin{near}-pin{far}"),
            PairName::NearShell => f.write_str("near shell"),
            PairName::FarShell => f.write_str("far shell"),
            PairName::ShellShell => f.write_str("shell-shell"),
        }
    }
}

// Serialized as its display name so it can key a JSON map.
impl Serialize for PairName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContinuityResult {
    pub passed: bool,
    pub pair_states: BTreeMap<PairName, bool>,
    /// Classified faults. TS carries at most one, XLR may carry several.
    pub reasons: Vec<FaultReason>,
}

impl ContinuityResult {
    /// The primary fault, if any.
    pub fn reason(&self) -> Option<&FaultReason> {
        self.reasons.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellBondResult {
    pub passed: bool,
    pub pair_states: BTreeMap<PairName, bool>,
    pub reasons: Vec<FaultReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResistanceResult {
    pub channel: Channel,
    pub passed: bool,
    pub raw_adc: u16,
    pub calibration: Option<CalibrationRecord>,
    pub milliohms: Option<u32>,
}

impl ResistanceResult {
    /// A reading with no usable calibration. Never passes.
    pub fn uncalibrated(channel: Channel, raw_adc: u16) -> Self {
        Self {
            channel,
            passed: false,
            raw_adc,
            calibration: None,
            milliohms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Step {
    Continuity,
    ShellBond,
    Resistance,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Continuity => f.pad("continuity"),
            Step::ShellBond => f.pad("shell bond"),
            Step::Resistance => f.pad("resistance"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StepOutcome {
    Passed,
    Failed,
    /// The exchange with the tester broke down; distinct from a failed cable.
    Errored(String),
    /// Not run because an earlier step did not pass.
    Skipped,
    /// Not meaningful for this topology/series.
    NotApplicable,
}

impl StepOutcome {
    pub fn was_executed(&self) -> bool {
        matches!(self, StepOutcome::Passed | StepOutcome::Failed | StepOutcome::Errored(_))
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, StepOutcome::Passed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StepDetail {
    Continuity(ContinuityResult),
    ShellBond(ShellBondResult),
    Resistance(Vec<ResistanceResult>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub step: Step,
    pub outcome: StepOutcome,
    pub detail: Option<StepDetail>,
}

impl StepRecord {
    pub fn new(step: Step, outcome: StepOutcome, detail: Option<StepDetail>) -> Self {
        Self { step, outcome, detail }
    }

    pub fn skipped(step: Step) -> Self {
        Self::new(step, StepOutcome::Skipped, None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestReport {
    pub topology: Topology,
    pub series: ProductSeries,
    pub tester_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    pub overall_passed: bool,
}

impl TestReport {
    pub fn new(
        topology: Topology,
        series: ProductSeries,
        tester_id: Option<String>,
        started_at: DateTime<Utc>,
        steps: Vec<StepRecord>,
    ) -> Self {
        let overall_passed = fold_overall(&steps);
        Self {
            topology,
            series,
            tester_id,
            started_at,
            steps,
            overall_passed,
        }
    }

    pub fn step(&self, step: Step) -> Option<&StepRecord> {
        self.steps.iter().find(|record| record.step == step)
    }

    pub fn outcome(&self, step: Step) -> Option<&StepOutcome> {
        self.step(step).map(|record| &record.outcome)
    }

    pub fn resistance(&self) -> &[ResistanceResult] {
        match self.step(Step::Resistance).and_then(|record| record.detail.as_ref()) {
            Some(StepDetail::Resistance(results)) => results,
            _ => &[],
        }
    }
}

/// True only when at least one step ran and every step that ran passed.
pub fn fold_overall(steps: &[StepRecord]) -> bool {
    let mut executed = steps.iter().filter(|record| record.outcome.was_executed()).peekable();
    executed.peek().is_some() && executed.all(|record| record.outcome.is_passed())
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} test ({:?}) on {}",
            self.topology,
            self.series,
            self.tester_id.as_deref().unwrap_or("unknown tester")
        )?;
        for record in &self.steps {
            match &record.outcome {
                StepOutcome::Errored(message) => writeln!(f, "  {:<11} ERROR: {message}", record.step)?,
                outcome => writeln!(f, "  {:<11} {:?}", record.step, outcome)?,
            }
            match &record.detail {
                Some(StepDetail::Continuity(result)) => {
                    for reason in &result.reasons {
                        writeln!(f, "      fault: {reason}")?;
                    }
                }
                Some(StepDetail::ShellBond(result)) => {
                    for reason in &result.reasons {
                        writeln!(f, "      fault: {reason}")?;
                    }
                }
                Some(StepDetail::Resistance(results)) => {
                    for reading in results {
                        match reading.milliohms {
                            Some(mohm) => writeln!(
                                f,
                                "      {}: {:.3} ohm (adc {})",
                                reading.channel,
                                milliohms_to_ohms(mohm),
                                reading.raw_adc
                            )?,
                            None => writeln!(
                                f,
                                "      {}: uncalibrated (adc {})",
                                reading.channel, reading.raw_adc
                            )?,
                        }
                    }
                }
                None => {}
            }
        }
        write!(f, "  overall: {}", if self.overall_passed { "PASS" } else { "FAIL" })
    }
}
