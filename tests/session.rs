use cable_tester::calibration::Channel;
use cable_tester::fault::FaultReason;
use cable_tester::orchestrator::{Prompt, RunState, TestOrchestrator};
use cable_tester::product::{ProductProfile, ProductSeries};
use cable_tester::protocol::{Circuit, Command};
use cable_tester::report::{Step, StepDetail, StepOutcome};
use cable_tester::report_store::{MemoryReportStore, ReportStore};
use cable_tester::simulator::{InjectedFault, SimulatedCable, Simulator};
use cable_tester::tester::{CableTester, SimulatedTester};
use cable_tester::{CommandTimeouts, ResistanceLimits, RunError};

fn session(simulator: Simulator) -> TestOrchestrator<SimulatedTester> {
    let tester = SimulatedTester::simulated(simulator, CommandTimeouts::default());
    let mut orchestrator = TestOrchestrator::new(tester, ResistanceLimits::default());
    orchestrator.identify().unwrap();
    orchestrator
}

fn simulator(orchestrator: &mut TestOrchestrator<SimulatedTester>) -> &mut Simulator {
    orchestrator.tester_mut().transport_mut().simulator_mut()
}

fn confirm_all(_: Prompt) -> bool {
    true
}

#[test]
fn ts_cable_passes_with_reading_below_zero_reference() {
    let mut sim = Simulator::new("GL-TESTER-02");
    sim.reference_adc.insert(Channel::Ts, 820);
    sim.cable = SimulatedCable::good().with_ts_adc(750);
    let mut orchestrator = session(sim);

    let report = orchestrator
        .run_test(Circuit::Ts, ProductSeries::Studio, &mut confirm_all)
        .unwrap();

    assert!(report.overall_passed);
    assert_eq!(report.tester_id.as_deref(), Some("GL-TESTER-02"));
    let reading = &report.resistance()[0];
    assert_eq!(reading.raw_adc, 750);
    assert_eq!(reading.milliohms, Some(0));
    assert_eq!(reading.calibration.map(|c| c.zero_adc), Some(820));
    assert!(reading.passed);
}

#[test]
fn missing_cable_fails_continuity_and_skips_resistance() {
    let mut orchestrator = session(Simulator::new("SIM-01"));
    orchestrator.calibrate(Circuit::Ts).unwrap();
    simulator(&mut orchestrator).cable = SimulatedCable::absent();

    let report = orchestrator
        .run_test(Circuit::Ts, ProductSeries::Studio, &mut confirm_all)
        .unwrap();

    assert!(!report.overall_passed);
    match &report.step(Step::Continuity).unwrap().detail {
        Some(StepDetail::Continuity(result)) => {
            assert_eq!(result.reason(), Some(&FaultReason::NoCable))
        }
        other => panic!("unexpected detail: {other:?}"),
    }
    assert_eq!(report.outcome(Step::Resistance), Some(&StepOutcome::Skipped));
    assert!(report.resistance().is_empty());
    assert!(!orchestrator.tester().transport().sent().is_empty());
}

#[test]
fn touring_xlr_runs_every_step() {
    let profile = ProductProfile::resolve("TC-20GL", "XLR").unwrap();
    let mut orchestrator = session(Simulator::new("SIM-01"));

    let report = orchestrator
        .run_test(profile.topology, profile.series, &mut confirm_all)
        .unwrap();

    assert!(report.overall_passed);
    assert_eq!(report.outcome(Step::Continuity), Some(&StepOutcome::Passed));
    assert_eq!(report.outcome(Step::ShellBond), Some(&StepOutcome::Passed));
    let milliohms: Vec<_> = report.resistance().iter().map(|r| r.milliohms).collect();
    assert_eq!(milliohms, vec![Some(145), Some(125)]);
    assert!(orchestrator
        .tester()
        .transport()
        .sent()
        .iter()
        .any(|line| line == "XSHELL"));
}

#[test]
fn studio_xlr_never_probes_shell() {
    let profile = ProductProfile::resolve("SV-20GL", "XLR").unwrap();
    let mut orchestrator = session(Simulator::new("SIM-01"));

    let report = orchestrator
        .run_test(profile.topology, profile.series, &mut confirm_all)
        .unwrap();

    assert_eq!(report.outcome(Step::ShellBond), Some(&StepOutcome::NotApplicable));
    assert!(!orchestrator
        .tester()
        .transport()
        .sent()
        .iter()
        .any(|line| line == "XSHELL"));
}

#[test]
fn xlr_pin_over_limit_fails_that_pin_only() {
    let mut sim = Simulator::new("SIM-01");
    sim.cable = SimulatedCable::good().with_pin_adc(65, 110);
    // Firmware limit relaxed so only the host limit decides.
    sim.xlr_limit_milliohms = 10_000;
    let mut orchestrator = session(sim);

    let report = orchestrator
        .run_test(Circuit::Xlr, ProductSeries::Studio, &mut confirm_all)
        .unwrap();

    assert_eq!(report.outcome(Step::Resistance), Some(&StepOutcome::Failed));
    let pins = report.resistance();
    assert!(pins[0].passed);
    assert!(!pins[1].passed);
    assert!(pins[1].milliohms.unwrap() > 200);
}

#[test]
fn device_error_during_resistance_is_errored_step() {
    let mut orchestrator = session(Simulator::new("SIM-01"));
    simulator(&mut orchestrator).inject(
        Command::RunResistance(Circuit::Ts),
        InjectedFault::DeviceError("ADC_SATURATED".to_string()),
    );

    let report = orchestrator
        .run_test(Circuit::Ts, ProductSeries::Studio, &mut confirm_all)
        .unwrap();

    match report.outcome(Step::Resistance) {
        Some(StepOutcome::Errored(message)) => assert!(message.contains("ADC_SATURATED")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!report.overall_passed);
    assert_eq!(orchestrator.state(), RunState::Errored);
}

#[test]
fn unplugged_tester_errors_the_run_then_recovers_after_reconnect() {
    let mut orchestrator = session(Simulator::new("SIM-01"));
    orchestrator.calibrate(Circuit::Ts).unwrap();
    orchestrator.tester_mut().transport_mut().unplug();

    let report = orchestrator
        .run_test(Circuit::Ts, ProductSeries::Studio, &mut confirm_all)
        .unwrap();
    assert!(matches!(
        report.outcome(Step::Continuity),
        Some(StepOutcome::Errored(_))
    ));

    orchestrator.reconnect().unwrap();
    assert!(!orchestrator.calibration().is_valid(Channel::Ts));

    let mut prompts = Vec::new();
    let mut gate = |prompt: Prompt| {
        prompts.push(prompt);
        true
    };
    let report = orchestrator
        .run_test(Circuit::Ts, ProductSeries::Studio, &mut gate)
        .unwrap();
    assert!(report.overall_passed);
    assert_eq!(prompts.first(), Some(&Prompt::InsertReference(Circuit::Ts)));
}

#[test]
fn device_calibration_drift_forces_recalibration() {
    let mut orchestrator = session(Simulator::new("SIM-01"));
    orchestrator.calibrate(Circuit::Ts).unwrap();
    simulator(&mut orchestrator).set_device_calibration(Channel::Ts, 75);

    let mut prompts = 0;
    let mut gate = |_: Prompt| {
        prompts += 1;
        true
    };
    let report = orchestrator
        .run_test(Circuit::Ts, ProductSeries::Studio, &mut gate)
        .unwrap();

    assert_eq!(prompts, 2);
    assert!(report.overall_passed);
    let record = orchestrator.calibration().valid(Channel::Ts).unwrap();
    assert_eq!(record.zero_adc, 60);
}

#[test]
fn device_that_stays_uncalibrated_never_passes() {
    let mut orchestrator = session(Simulator::new("SIM-01"));
    orchestrator.calibrate(Circuit::Ts).unwrap();
    // Calibration replies succeed, but the board keeps answering without CAL.
    simulator(&mut orchestrator).inject(
        Command::RunResistance(Circuit::Ts),
        InjectedFault::Raw("RES:FAIL:ADC:65:OHM:UNCAL".to_string()),
    );

    let report = orchestrator
        .run_test(Circuit::Ts, ProductSeries::Studio, &mut confirm_all)
        .unwrap();

    assert_eq!(report.outcome(Step::Resistance), Some(&StepOutcome::Failed));
    let reading = &report.resistance()[0];
    assert!(!reading.passed);
    assert_eq!(reading.milliohms, None);
    assert_eq!(reading.calibration, None);
}

#[test]
fn cancelling_recalibration_gives_no_report() {
    let mut orchestrator = session(Simulator::new("SIM-01"));
    orchestrator.calibrate(Circuit::Ts).unwrap();
    simulator(&mut orchestrator).power_cycle();

    let mut refuse = |_: Prompt| false;
    let err = orchestrator
        .run_test(Circuit::Ts, ProductSeries::Studio, &mut refuse)
        .unwrap_err();
    assert!(matches!(err, RunError::Cancelled));
}

#[test]
fn noisy_firmware_output_is_tolerated() {
    let mut sim = Simulator::new("SIM-01");
    sim.chatter = true;
    let mut orchestrator = session(sim);

    let report = orchestrator
        .run_test(Circuit::Ts, ProductSeries::Touring, &mut confirm_all)
        .unwrap();
    assert!(report.overall_passed);
    assert_eq!(report.outcome(Step::ShellBond), Some(&StepOutcome::NotApplicable));
}

#[test]
fn reports_are_stored_under_cable_id() {
    let mut orchestrator = session(Simulator::new("SIM-01"));
    let report = orchestrator
        .run_test(Circuit::Ts, ProductSeries::Studio, &mut confirm_all)
        .unwrap();

    let mut store = MemoryReportStore::default();
    store.store("SC-20GL-0007", &report).unwrap();
    assert_eq!(store.reports[0].0, "SC-20GL-0007");
    assert!(store.reports[0].1.overall_passed);
}

#[test]
fn status_reflects_connection() {
    let mut orchestrator = session(Simulator::new("SIM-01"));
    let status = orchestrator.get_status().unwrap();
    assert!(status.connected);
    assert_eq!(status.tester_id.as_deref(), Some("SIM-01"));

    orchestrator.tester_mut().close();
    assert!(!orchestrator.get_status().unwrap().connected);
}
