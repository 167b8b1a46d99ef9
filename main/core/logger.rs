//! The simulator's log backend: plain-text records on stderr, stamped with
//! both real elapsed time and the worker's current virtual time.

use std::io::Write;
use std::time::Instant;

use log::{Level, LevelFilter, Log, Metadata, Record};
use sim_support::emulated_time::EmulatedTime;

use crate::core::worker::Worker;

struct SimLogger {
    start: Instant,
    level: LevelFilter,
}

impl Log for SimLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let real_elapsed = self.start.elapsed();

        // the virtual clock, when called from a worker mid-round
        let virtual_time = Worker::current_time()
            .map(|now| {
                let since_start = now.duration_since(&EmulatedTime::SIMULATION_START);
                format!(
                    "{:02}:{:02}:{:02}.{:06}",
                    since_start.as_secs() / 3600,
                    (since_start.as_secs() / 60) % 60,
                    since_start.as_secs() % 60,
                    since_start.subsec_micros(),
                )
            })
            .unwrap_or_else(|| "n/a".to_string());

        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("-");

        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "{:07}.{:06} [{}] {} [{}] [{}] {}",
            real_elapsed.as_secs(),
            real_elapsed.subsec_micros(),
            thread_name,
            virtual_time,
            record.level(),
            record.target(),
            record.args(),
        );

        // errors should hit the terminal before an abort does
        if record.level() <= Level::Error {
            let _ = stderr.flush();
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().lock().flush();
    }
}

/// Install the simulator logger. May only be called once per process.
pub fn install(level: LevelFilter) -> anyhow::Result<()> {
    let logger = SimLogger {
        start: Instant::now(),
        level,
    };

    log::set_boxed_logger(Box::new(logger))
        .map_err(|e| anyhow::anyhow!("installing logger: {e}"))?;
    log::set_max_level(level);

    Ok(())
}
