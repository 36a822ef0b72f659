use cable_tester::calibration::Channel;
use cable_tester::orchestrator::{ConfirmationGate, Prompt, TestOrchestrator};
use cable_tester::product::ProductSeries;
use cable_tester::protocol::Circuit;
use cable_tester::report_store::{JsonLinesReportStore, ReportStore};
use cable_tester::simulator::{self, Simulator};
use cable_tester::tester::{CableTester, CalibrationOutcome, SerialTester, SimulatedTester};
use cable_tester::TesterConfig;
use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

// The main entry point for the cable tester bench application.
fn main() -> ExitCode {
    let config = match TesterConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[ERROR] {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.log_json);

    println!("=========================");
    println!("   Cable Tester Bench    ");
    println!("=========================");

    let mut reports = config.report_log.as_deref().map(JsonLinesReportStore::new);

    let result = if config.simulate {
        println!("Using the built-in fixture simulator.");
        let tester = SimulatedTester::simulated(Simulator::new("SIM-01"), config.timeouts);
        run_menu(TestOrchestrator::new(tester, config.limits), &mut reports)
    } else {
        match SerialTester::open(&config) {
            Ok(tester) => run_menu(TestOrchestrator::new(tester, config.limits), &mut reports),
            Err(e) => {
                eprintln!("[ERROR] {}", e);
                return ExitCode::FAILURE;
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[ERROR] Console I/O failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

// Logs go to stderr so they do not interleave with the menu.
fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    }
}

// Prints a prompt and reads one trimmed line. EOF is an error so loops end.
fn ask(message: &str) -> io::Result<String> {
    print!("{}", message);
    io::stdout().flush()?;
    let mut input = String::new();
    if io::stdin().read_line(&mut input)? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stdin closed"));
    }
    Ok(input.trim().to_string())
}

// Operator confirmation on the console: Enter continues, 'q' cancels.
struct ConsoleGate;

impl ConfirmationGate for ConsoleGate {
    fn confirm(&mut self, prompt: Prompt) -> bool {
        match ask(&format!("{}, then press Enter (q to cancel): ", prompt)) {
            Ok(answer) => !answer.eq_ignore_ascii_case("q"),
            Err(_) => false,
        }
    }
}

// Main menu loop.
fn run_menu<C: CableTester>(
    mut orchestrator: TestOrchestrator<C>,
    reports: &mut Option<JsonLinesReportStore>,
) -> io::Result<()> {
    match orchestrator.identify() {
        Ok(id) => println!("Connected to tester {}", id),
        Err(e) => eprintln!("[WARNING] Tester did not identify: {}", e),
    }

    loop {
        println!("\nSelect action:");
        println!("  1. Test TS cable");
        println!("  2. Test XLR cable");
        println!("  3. Calibrate TS");
        println!("  4. Calibrate XLR");
        println!("  5. Tester status");
        println!("  6. Reset tester");
        println!("  7. Reconnect");
        println!("  8. Serve simulated fixture on a serial port");
        println!("  9. Exit");

        match ask("> ")?.as_str() {
            "1" => run_test(&mut orchestrator, Circuit::Ts, reports)?,
            "2" => run_test(&mut orchestrator, Circuit::Xlr, reports)?,
            "3" => run_calibration(&mut orchestrator, Circuit::Ts),
            "4" => run_calibration(&mut orchestrator, Circuit::Xlr),
            "5" => show_status(&mut orchestrator),
            "6" => match orchestrator.reset() {
                Ok(()) => println!("Tester reset. Calibration cleared."),
                Err(e) => eprintln!("[ERROR] Reset failed: {}", e),
            },
            "7" => match orchestrator.reconnect() {
                Ok(()) => println!("Reconnected. Calibration cleared."),
                Err(e) => eprintln!("[ERROR] Reconnect failed: {}", e),
            },
            "8" => run_serve_mode()?,
            "9" => break,
            _ => eprintln!("[ERROR] Invalid choice. Please enter 1-9."),
        }
    }
    Ok(())
}

fn run_test<C: CableTester>(
    orchestrator: &mut TestOrchestrator<C>,
    topology: Circuit,
    reports: &mut Option<JsonLinesReportStore>,
) -> io::Result<()> {
    let sku = ask("Product SKU (e.g. TC-20GL): ")?;
    let series = match ProductSeries::from_sku(&sku) {
        Ok(series) => series,
        Err(e) => {
            eprintln!("[ERROR] {}", e);
            return Ok(());
        }
    };
    let serial = ask("Cable serial number (blank to skip): ")?;

    match orchestrator.run_test(topology, series, &mut ConsoleGate) {
        Ok(report) => {
            println!("\n{}", report);
            if let Some(store) = reports.as_mut() {
                let cable_id = if serial.is_empty() { sku.as_str() } else { serial.as_str() };
                if let Err(e) = store.store(cable_id, &report) {
                    eprintln!("[ERROR] Could not save report: {}", e);
                }
            }
        }
        Err(e) => eprintln!("[ERROR] {}", e),
    }
    Ok(())
}

fn run_calibration<C: CableTester>(orchestrator: &mut TestOrchestrator<C>, circuit: Circuit) {
    if !ConsoleGate.confirm(Prompt::InsertReference(circuit)) {
        println!("Calibration cancelled.");
        return;
    }
    match orchestrator.calibrate(circuit) {
        Ok(CalibrationOutcome::Calibrated(records)) => {
            for record in records {
                println!("  {}: zero ADC {}", record.channel, record.zero_adc);
            }
        }
        Ok(CalibrationOutcome::Rejected { reason }) => {
            eprintln!("[ERROR] Calibration rejected: {}", reason)
        }
        Err(e) => eprintln!("[ERROR] Calibration failed: {}", e),
    }
}

fn show_status<C: CableTester>(orchestrator: &mut TestOrchestrator<C>) {
    match orchestrator.get_status() {
        Ok(status) => {
            println!("Port:      {}", status.port);
            println!("Tester:    {}", status.tester_id.as_deref().unwrap_or("unknown"));
            println!("Connected: {}", status.connected);
            if let Some(state) = status.state {
                println!("State:     {:?}", state);
            }
        }
        Err(e) => eprintln!("[ERROR] Status failed: {}", e),
    }
    for channel in Channel::ALL {
        match orchestrator.calibration().valid(channel) {
            Some(record) => println!(
                "  {:<10} zero ADC {} (captured {})",
                channel.to_string(),
                record.zero_adc,
                record.captured_at.format("%H:%M:%S")
            ),
            None => println!("  {:<10} not calibrated", channel.to_string()),
        }
    }
}

// Answers commands arriving on a serial port with a fresh fixture simulator,
// so host software can be exercised without a board attached.
fn run_serve_mode() -> io::Result<()> {
    println!("\n--- Serve Mode ---");

    // List available serial ports.
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            eprintln!("[ERROR] Could not enumerate serial ports: {}", e);
            return Ok(());
        }
    };

    if ports.is_empty() {
        eprintln!("[ERROR] No serial ports found.");
        return Ok(());
    }

    println!("Available serial ports:");
    for (i, port) in ports.iter().enumerate() {
        println!("  {}: {}", i, port.port_name);
    }

    // Get user's choice of serial port.
    let port_index: usize = match ask("Select a port (number): ")?.parse() {
        Ok(i) if i < ports.len() => i,
        _ => {
            eprintln!("[ERROR] Invalid port selection.");
            return Ok(());
        }
    };
    let port_name = &ports[port_index].port_name;

    // Get user's choice of baud rate.
    let baud_rates = [9600, 19200, 38400, 57600, 115200];
    println!("Available baud rates:");
    for (i, &rate) in baud_rates.iter().enumerate() {
        println!("  {}: {}", i, rate);
    }
    let baud_index: usize = match ask("Select a baud rate (number): ")?.parse() {
        Ok(i) if i < baud_rates.len() => i,
        _ => {
            eprintln!("[ERROR] Invalid baud rate selection.");
            return Ok(());
        }
    };
    let baud_rate = baud_rates[baud_index];

    // Open the selected serial port.
    let mut port = match serialport::new(port_name, baud_rate)
        .timeout(Duration::from_millis(10))
        .open()
    {
        Ok(port) => port,
        Err(e) => {
            eprintln!("[ERROR] Failed to open port '{}': {}", port_name, e);
            return Ok(());
        }
    };

    println!(
        "\nServing simulated fixture on {} at {} baud. Press Ctrl+C to exit.",
        port_name, baud_rate
    );

    let mut fixture = Simulator::new("SIM-SERIAL");
    if let Err(e) = simulator::serve(&mut port, &mut fixture) {
        eprintln!("[ERROR] Serial port error: {}", e);
    }
    println!("Serve mode stopped.");
    Ok(())
}
