use std::process::ExitCode;

use clap::Parser;

use mirage::core::configuration::{exit_code, CliOptions, Scenario};
use mirage::core::{controller, logger};
use mirage::host::managed;

fn main() -> ExitCode {
    let options = CliOptions::parse();

    // the scenario decides the log level, so peek at it before anything else
    let log_level = match Scenario::from_file(&options.scenario) {
        Ok(scenario) => scenario
            .options
            .log_level(options.verbose)
            .unwrap_or(log::LevelFilter::Info),
        Err(_) => log::LevelFilter::Info,
    };

    if let Err(e) = logger::install(log_level) {
        eprintln!("mirage: {e:#}");
        return ExitCode::from(exit_code::INTERNAL_ASSERTION as u8);
    }

    managed::install_panic_hook();

    // ctrl-c flushes the log and reports the conventional 130
    let mut signals =
        match signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT]) {
            Ok(signals) => signals,
            Err(e) => {
                log::error!("Installing signal handler: {e}");
                return ExitCode::from(exit_code::INTERNAL_ASSERTION as u8);
            }
        };
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            log::info!("Interrupted; flushing log and exiting");
            log::logger().flush();
            std::process::exit(exit_code::INTERRUPTED);
        }
    });

    match controller::run_from_cli(&options) {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            log::error!("{e:#}");
            log::logger().flush();

            // configuration problems and unreadable inputs get distinct codes
            let code = if e.root_cause().downcast_ref::<std::io::Error>().is_some() {
                exit_code::INPUT_IO_ERROR
            } else {
                exit_code::BAD_CONFIGURATION
            };
            ExitCode::from(code as u8)
        }
    }
}
