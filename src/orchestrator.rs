//! Test-run state machine.
//!
//! A run walks `Idle -> CheckingCalibration -> [Calibrating] ->
//! RunningContinuity -> [RunningShellBond] -> RunningResistance -> Complete`.
//! A failed step short-circuits the rest, which are recorded as skipped; a
//! broken exchange marks its step errored and ends the run in `Errored`.
//! Only cancellation and calibration failure abort without a report.

use std::fmt;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::calibration::CalibrationStore;
use crate::config::ResistanceLimits;
use crate::error::{ConnectError, RunError, TesterError};
use crate::measurement::convert;
use crate::product::{shell_bond_applicable, ProductSeries};
use crate::protocol::{Circuit, PinReading, ResistanceFrame};
use crate::report::{
    ResistanceResult, Step, StepDetail, StepOutcome, StepRecord, TestReport, Topology,
};
use crate::tester::{CableTester, CalibrationOutcome, DeviceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    CheckingCalibration,
    Calibrating,
    RunningContinuity,
    RunningShellBond,
    RunningResistance,
    Complete,
    Errored,
}

/// Something the operator must do at the fixture before the run continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    /// Swap in the zero-ohm reference cable for this circuit.
    InsertReference(Circuit),
    /// Put the cable under test back after calibration.
    ReinsertCableUnderTest,
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prompt::InsertReference(circuit) => {
                write!(f, "Insert the {circuit} zero-ohm reference cable")
            }
            Prompt::ReinsertCableUnderTest => f.write_str("Reinsert the cable under test"),
        }
    }
}

/// Operator confirmation. Returning `false` cancels the run.
pub trait ConfirmationGate {
    fn confirm(&mut self, prompt: Prompt) -> bool;
}

impl<F: FnMut(Prompt) -> bool> ConfirmationGate for F {
    fn confirm(&mut self, prompt: Prompt) -> bool {
        self(prompt)
    }
}

/// How a step ended when it did not produce a result.
enum StepFailure {
    /// The exchange broke; the step is errored and the run continues to report.
    Exchange(TesterError),
    /// The whole run must stop without a report.
    Abort(RunError),
}

impl From<TesterError> for StepFailure {
    fn from(err: TesterError) -> Self {
        StepFailure::Exchange(err)
    }
}

/// Drives one tester through test runs. Closes the tester when dropped.
pub struct TestOrchestrator<C: CableTester> {
    tester: C,
    store: CalibrationStore,
    limits: ResistanceLimits,
    state: RunState,
}

impl<C: CableTester> TestOrchestrator<C> {
    pub fn new(tester: C, limits: ResistanceLimits) -> Self {
        Self {
            tester,
            store: CalibrationStore::new(),
            limits,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn calibration(&self) -> &CalibrationStore {
        &self.store
    }

    pub fn tester(&self) -> &C {
        &self.tester
    }

    pub fn tester_mut(&mut self) -> &mut C {
        &mut self.tester
    }

    fn transition(&mut self, next: RunState) {
        info!(from = ?self.state, to = ?next, "run state");
        self.state = next;
    }

    pub fn identify(&mut self) -> Result<String, TesterError> {
        self.tester.identify()
    }

    pub fn get_status(&mut self) -> Result<DeviceStatus, TesterError> {
        self.tester.status()
    }

    /// Resets the tester. A successful reset drops every calibration.
    pub fn reset(&mut self) -> Result<(), TesterError> {
        self.tester.reset()?;
        self.store.invalidate_all();
        self.state = RunState::Idle;
        Ok(())
    }

    /// Re-opens the link. Calibration does not survive a reconnect.
    pub fn reconnect(&mut self) -> Result<(), ConnectError> {
        self.store.invalidate_all();
        self.tester.reconnect()?;
        self.state = RunState::Idle;
        Ok(())
    }

    /// Calibrates `circuit` with whatever is in the fixture right now.
    ///
    /// The caller is responsible for the reference cable being inserted.
    pub fn calibrate(&mut self, circuit: Circuit) -> Result<CalibrationOutcome, TesterError> {
        let outcome = self.tester.calibrate(circuit)?;
        match &outcome {
            CalibrationOutcome::Calibrated(records) => {
                for record in records {
                    info!(channel = %record.channel, zero_adc = record.zero_adc, "calibration stored");
                    self.store.set(record.channel, *record);
                }
            }
            CalibrationOutcome::Rejected { reason } => {
                warn!(%circuit, %reason, "calibration rejected by tester");
            }
        }
        Ok(outcome)
    }

    /// Runs a full test of the cable currently in the fixture.
    pub fn run_test<G>(
        &mut self,
        topology: Topology,
        series: ProductSeries,
        gate: &mut G,
    ) -> Result<TestReport, RunError>
    where
        G: ConfirmationGate + ?Sized,
    {
        let started_at = Utc::now();
        info!(%topology, ?series, "starting test run");

        match self.run_steps(topology, series, gate) {
            Ok(steps) => {
                let errored = steps
                    .iter()
                    .any(|record| matches!(record.outcome, StepOutcome::Errored(_)));
                self.transition(if errored { RunState::Errored } else { RunState::Complete });

                let report = TestReport::new(
                    topology,
                    series,
                    self.tester.tester_id().map(str::to_string),
                    started_at,
                    steps,
                );
                info!(%topology, passed = report.overall_passed, "test run finished");
                Ok(report)
            }
            Err(err) => {
                error!(%topology, error = %err, "test run aborted");
                self.state = match err {
                    RunError::Calibration(_) => RunState::Errored,
                    RunError::Cancelled | RunError::CalibrationFailed(_) => RunState::Idle,
                };
                Err(err)
            }
        }
    }

    fn run_steps<G>(
        &mut self,
        topology: Topology,
        series: ProductSeries,
        gate: &mut G,
    ) -> Result<Vec<StepRecord>, RunError>
    where
        G: ConfirmationGate + ?Sized,
    {
        self.transition(RunState::CheckingCalibration);
        self.ensure_calibrated(topology, gate)?;

        let mut steps = Vec::with_capacity(3);

        self.transition(RunState::RunningContinuity);
        match self.tester.run_continuity(topology) {
            Ok(result) => {
                let passed = result.passed;
                if let Some(reason) = result.reason() {
                    info!(%topology, %reason, "continuity failed");
                }
                steps.push(StepRecord::new(
                    Step::Continuity,
                    pass_or_fail(passed),
                    Some(StepDetail::Continuity(result)),
                ));
                if !passed {
                    steps.push(StepRecord::skipped(Step::ShellBond));
                    steps.push(StepRecord::skipped(Step::Resistance));
                    return Ok(steps);
                }
            }
            Err(err) => {
                steps.push(errored(Step::Continuity, &err));
                steps.push(StepRecord::skipped(Step::ShellBond));
                steps.push(StepRecord::skipped(Step::Resistance));
                return Ok(steps);
            }
        }

        if shell_bond_applicable(topology, series) {
            self.transition(RunState::RunningShellBond);
            match self.tester.run_shell_bond() {
                Ok(result) => {
                    let passed = result.passed;
                    steps.push(StepRecord::new(
                        Step::ShellBond,
                        pass_or_fail(passed),
                        Some(StepDetail::ShellBond(result)),
                    ));
                    if !passed {
                        steps.push(StepRecord::skipped(Step::Resistance));
                        return Ok(steps);
                    }
                }
                Err(err) => {
                    steps.push(errored(Step::ShellBond, &err));
                    steps.push(StepRecord::skipped(Step::Resistance));
                    return Ok(steps);
                }
            }
        } else {
            steps.push(StepRecord::new(Step::ShellBond, StepOutcome::NotApplicable, None));
        }

        self.transition(RunState::RunningResistance);
        match self.measure_resistance(topology, gate) {
            Ok(results) => {
                let passed = !results.is_empty() && results.iter().all(|r| r.passed);
                steps.push(StepRecord::new(
                    Step::Resistance,
                    pass_or_fail(passed),
                    Some(StepDetail::Resistance(results)),
                ));
            }
            Err(StepFailure::Exchange(err)) => steps.push(errored(Step::Resistance, &err)),
            Err(StepFailure::Abort(err)) => return Err(err),
        }

        Ok(steps)
    }

    /// Calibrates the topology's channels if any of them lacks a valid record.
    fn ensure_calibrated<G>(&mut self, topology: Topology, gate: &mut G) -> Result<(), RunError>
    where
        G: ConfirmationGate + ?Sized,
    {
        let missing: Vec<_> = topology
            .channels()
            .iter()
            .filter(|channel| !self.store.is_valid(**channel))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        info!(%topology, ?missing, "calibration required");
        self.calibrate_with_operator(topology, gate)
    }

    /// Reference-cable calibration wrapped in the two operator prompts.
    fn calibrate_with_operator<G>(&mut self, circuit: Circuit, gate: &mut G) -> Result<(), RunError>
    where
        G: ConfirmationGate + ?Sized,
    {
        self.transition(RunState::Calibrating);
        if !gate.confirm(Prompt::InsertReference(circuit)) {
            return Err(RunError::Cancelled);
        }
        if let CalibrationOutcome::Rejected { reason } = self.calibrate(circuit)? {
            return Err(RunError::CalibrationFailed(reason));
        }
        if !gate.confirm(Prompt::ReinsertCableUnderTest) {
            return Err(RunError::Cancelled);
        }
        Ok(())
    }

    /// Probes resistance, recalibrating once if the device and host disagree
    /// about the zero reference.
    fn measure_resistance<G>(
        &mut self,
        circuit: Circuit,
        gate: &mut G,
    ) -> Result<Vec<ResistanceResult>, StepFailure>
    where
        G: ConfirmationGate + ?Sized,
    {
        let mut frame = self.tester.run_resistance(circuit)?;

        if self.needs_recalibration(&frame) {
            warn!(%circuit, "tester calibration missing or out of step, recalibrating");
            for channel in circuit.channels() {
                self.store.invalidate(*channel);
            }
            self.calibrate_with_operator(circuit, gate)
                .map_err(StepFailure::Abort)?;
            self.transition(RunState::RunningResistance);
            frame = self.tester.run_resistance(circuit)?;
        }

        let limit = self.limits.max_milliohms(circuit);
        Ok(frame
            .readings
            .iter()
            .map(|reading| self.interpret(reading, frame.passed, limit))
            .collect())
    }

    fn needs_recalibration(&self, frame: &ResistanceFrame) -> bool {
        frame.readings.iter().any(|reading| {
            match (reading.device_cal, self.store.valid(reading.channel)) {
                (Some(device), Some(record)) => device != record.zero_adc,
                _ => true,
            }
        })
    }

    /// Applies the host calibration to one reading.
    fn interpret(&self, reading: &PinReading, device_passed: bool, limit: u32) -> ResistanceResult {
        let record = match (reading.device_cal, self.store.valid(reading.channel)) {
            (Some(device), Some(record)) => {
                if device != record.zero_adc {
                    warn!(
                        channel = %reading.channel,
                        device_cal = device,
                        host_cal = record.zero_adc,
                        "calibration mismatch persists, using host record"
                    );
                }
                record
            }
            _ => {
                warn!(channel = %reading.channel, raw_adc = reading.raw_adc, "reading is uncalibrated");
                return ResistanceResult::uncalibrated(reading.channel, reading.raw_adc);
            }
        };

        let milliohms = convert(reading.raw_adc, &record);
        let passed = device_passed && milliohms <= limit;
        info!(channel = %reading.channel, raw_adc = reading.raw_adc, milliohms, passed, "resistance");
        ResistanceResult {
            channel: reading.channel,
            passed,
            raw_adc: reading.raw_adc,
            calibration: Some(record),
            milliohms: Some(milliohms),
        }
    }
}

impl<C: CableTester> Drop for TestOrchestrator<C> {
    fn drop(&mut self) {
        self.tester.close();
    }
}

fn pass_or_fail(passed: bool) -> StepOutcome {
    if passed {
        StepOutcome::Passed
    } else {
        StepOutcome::Failed
    }
}

fn errored(step: Step, err: &TesterError) -> StepRecord {
    error!(%step, error = %err, "step errored");
    StepRecord::new(step, StepOutcome::Errored(err.to_string()), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Channel;
    use crate::config::CommandTimeouts;
    use crate::protocol::Command;
    use crate::simulator::{InjectedFault, SimulatedCable, Simulator};
    use crate::tester::SimulatedTester;

    fn orchestrator(cable: SimulatedCable) -> TestOrchestrator<SimulatedTester> {
        let mut simulator = Simulator::new("SIM-01");
        simulator.cable = cable;
        let tester = SimulatedTester::simulated(simulator, CommandTimeouts::default());
        TestOrchestrator::new(tester, ResistanceLimits::default())
    }

    fn sim(orch: &mut TestOrchestrator<SimulatedTester>) -> &mut Simulator {
        orch.tester_mut().transport_mut().simulator_mut()
    }

    fn always(_: Prompt) -> bool {
        true
    }

    #[test]
    fn first_run_calibrates_then_passes() {
        let mut orch = orchestrator(SimulatedCable::good());
        let mut prompts = Vec::new();
        let mut gate = |prompt: Prompt| {
            prompts.push(prompt);
            true
        };
        let report = orch.run_test(Circuit::Ts, ProductSeries::Studio, &mut gate).unwrap();

        assert!(report.overall_passed);
        assert_eq!(
            prompts,
            vec![Prompt::InsertReference(Circuit::Ts), Prompt::ReinsertCableUnderTest]
        );
        assert_eq!(report.outcome(Step::ShellBond), Some(&StepOutcome::NotApplicable));
        assert_eq!(report.resistance()[0].milliohms, Some(104));
        assert_eq!(orch.state(), RunState::Complete);
        assert!(orch.calibration().is_valid(Channel::Ts));
    }

    #[test]
    fn second_run_reuses_calibration() {
        let mut orch = orchestrator(SimulatedCable::good());
        orch.run_test(Circuit::Ts, ProductSeries::Studio, &mut always).unwrap();

        let mut asked = false;
        let mut gate = |_: Prompt| {
            asked = true;
            true
        };
        let report = orch.run_test(Circuit::Ts, ProductSeries::Studio, &mut gate).unwrap();
        assert!(report.overall_passed);
        assert!(!asked);
    }

    #[test]
    fn continuity_failure_skips_remaining_steps() {
        let mut orch = orchestrator(SimulatedCable::good().with_ts_fault("REVERSED"));
        let report = orch.run_test(Circuit::Ts, ProductSeries::Studio, &mut always).unwrap();

        assert!(!report.overall_passed);
        assert_eq!(report.outcome(Step::Continuity), Some(&StepOutcome::Failed));
        assert_eq!(report.outcome(Step::ShellBond), Some(&StepOutcome::Skipped));
        assert_eq!(report.outcome(Step::Resistance), Some(&StepOutcome::Skipped));
        assert_eq!(orch.state(), RunState::Complete);
    }

    #[test]
    fn studio_xlr_has_no_shell_bond() {
        let mut orch = orchestrator(SimulatedCable::good().with_shell(false, false));
        let report = orch.run_test(Circuit::Xlr, ProductSeries::Studio, &mut always).unwrap();
        assert_eq!(report.outcome(Step::ShellBond), Some(&StepOutcome::NotApplicable));
        assert!(report.overall_passed);
        assert_eq!(report.resistance().len(), 2);
    }

    #[test]
    fn touring_xlr_shell_failure_skips_resistance() {
        let mut orch = orchestrator(SimulatedCable::good().with_shell(true, false));
        let report = orch.run_test(Circuit::Xlr, ProductSeries::Touring, &mut always).unwrap();
        assert_eq!(report.outcome(Step::ShellBond), Some(&StepOutcome::Failed));
        assert_eq!(report.outcome(Step::Resistance), Some(&StepOutcome::Skipped));
        assert!(!report.overall_passed);
    }

    #[test]
    fn high_resistance_fails_against_limit() {
        let mut orch = orchestrator(SimulatedCable::good().with_ts_adc(120));
        let report = orch.run_test(Circuit::Ts, ProductSeries::Studio, &mut always).unwrap();
        assert_eq!(report.outcome(Step::Resistance), Some(&StepOutcome::Failed));
        assert_eq!(report.resistance()[0].milliohms, Some(1246));
    }

    #[test]
    fn cancel_at_gate_aborts_without_report() {
        let mut orch = orchestrator(SimulatedCable::good());
        let mut refuse = |_: Prompt| false;
        let err = orch.run_test(Circuit::Ts, ProductSeries::Studio, &mut refuse).unwrap_err();
        assert!(matches!(err, RunError::Cancelled));
        assert_eq!(orch.state(), RunState::Idle);
        assert!(!orch.calibration().is_valid(Channel::Ts));
    }

    #[test]
    fn cancel_after_calibration_still_aborts() {
        let mut orch = orchestrator(SimulatedCable::good());
        let mut gate = |prompt: Prompt| prompt != Prompt::ReinsertCableUnderTest;
        let err = orch.run_test(Circuit::Ts, ProductSeries::Studio, &mut gate).unwrap_err();
        assert!(matches!(err, RunError::Cancelled));
    }

    #[test]
    fn rejected_calibration_aborts_run() {
        let mut orch = orchestrator(SimulatedCable::absent());
        let err = orch.run_test(Circuit::Xlr, ProductSeries::Touring, &mut always).unwrap_err();
        assert!(matches!(err, RunError::CalibrationFailed(ref reason) if reason == "NO_CABLE"));
    }

    #[test]
    fn timeout_marks_step_errored() {
        let mut orch = orchestrator(SimulatedCable::good());
        sim(&mut orch).inject(Command::RunContinuity(Circuit::Ts), InjectedFault::Silent);
        let report = orch.run_test(Circuit::Ts, ProductSeries::Studio, &mut always).unwrap();

        assert!(matches!(report.outcome(Step::Continuity), Some(StepOutcome::Errored(_))));
        assert_eq!(report.outcome(Step::Resistance), Some(&StepOutcome::Skipped));
        assert!(!report.overall_passed);
        assert_eq!(orch.state(), RunState::Errored);
    }

    #[test]
    fn device_lost_calibration_triggers_recalibration() {
        let mut orch = orchestrator(SimulatedCable::good());
        orch.run_test(Circuit::Ts, ProductSeries::Studio, &mut always).unwrap();
        sim(&mut orch).power_cycle();

        let mut prompts = 0;
        let mut gate = |_: Prompt| {
            prompts += 1;
            true
        };
        let report = orch.run_test(Circuit::Ts, ProductSeries::Studio, &mut gate).unwrap();
        assert_eq!(prompts, 2);
        assert!(report.overall_passed);
        assert_eq!(sim(&mut orch).device_calibration(Channel::Ts), Some(60));
    }

    #[test]
    fn reset_invalidates_calibration() {
        let mut orch = orchestrator(SimulatedCable::good());
        orch.calibrate(Circuit::Xlr).unwrap();
        assert!(orch.calibration().is_valid(Channel::XlrPin2));
        orch.reset().unwrap();
        assert!(!orch.calibration().is_valid(Channel::XlrPin2));
        assert!(!orch.calibration().is_valid(Channel::XlrPin3));
    }

    #[test]
    fn reconnect_invalidates_calibration() {
        let mut orch = orchestrator(SimulatedCable::good());
        orch.calibrate(Circuit::Ts).unwrap();
        orch.reconnect().unwrap();
        assert!(!orch.calibration().is_valid(Channel::Ts));
        assert_eq!(orch.state(), RunState::Idle);
    }
}
