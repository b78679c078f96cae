//! The `log`-crate backend that renders spec.md §6's line format and
//! resolves the `MSM_OUTPUT` destination.
//!
//! Left uninstalled (the `MSM_OUTPUT` unset case), `log`'s default
//! max level is `Off`, so every `log::info!`/`warn!`/`error!` call
//! site in the rest of the crate costs one atomic load and nothing
//! else -- we don't need our own enabled/disabled switch on top of it.

use std::io::Write;
use std::sync::{Mutex, Once};

enum Destination {
    Stdout,
    Stderr,
    File(std::fs::File),
}

struct MsmLogger {
    destination: Mutex<Destination>,
}

impl MsmLogger {
    fn write_line(&self, level: &str, args: &std::fmt::Arguments) {
        let pid = std::process::id();
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let line = format!("{} {} [{}] {}\n", secs, pid, level, args);

        let mut destination = self.destination.lock().unwrap();
        let _ = match &mut *destination {
            Destination::Stdout => std::io::stdout().write_all(line.as_bytes()),
            Destination::Stderr => std::io::stderr().write_all(line.as_bytes()),
            Destination::File(file) => file.write_all(line.as_bytes()),
        };
    }
}

impl log::Log for MsmLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = match record.level() {
            log::Level::Error => "ERROR",
            log::Level::Warn => "WARN",
            log::Level::Info => "INFO",
            // spec.md's log levels are INFO/WARN/ERROR only; DEBUG/TRACE
            // never reach here because `enabled` filters them out.
            log::Level::Debug | log::Level::Trace => return,
        };

        self.write_line(level, record.args());
    }

    fn flush(&self) {
        let mut destination = self.destination.lock().unwrap();
        let _ = match &mut *destination {
            Destination::Stdout => std::io::stdout().flush(),
            Destination::Stderr => std::io::stderr().flush(),
            Destination::File(file) => file.flush(),
        };
    }
}

static LOGGING_INIT: Once = Once::new();

/// Resolves `MSM_OUTPUT` (spec.md §6) and installs the matching
/// backend. Idempotent and safe to call from every
/// `ensure_initialized` -- only the first call does anything.
pub fn init_logging() {
    LOGGING_INIT.call_once(|| match std::env::var("MSM_OUTPUT") {
        Err(_) => {
            // Unset: leave `log` without an installed logger, which
            // defaults its max level to `Off`.
        }
        Ok(value) if value == "stdout" => install(Destination::Stdout),
        Ok(path) => match std::fs::File::create(&path) {
            Ok(file) => install(Destination::File(file)),
            Err(err) => {
                install(Destination::Stderr);
                log::error!("logging - failed to open {} for writing: {}", path, err);
            }
        },
    });
}

fn install(destination: Destination) {
    let logger: &'static MsmLogger = Box::leak(Box::new(MsmLogger {
        destination: Mutex::new(destination),
    }));
    log::set_logger(logger).expect("logger is only ever installed once, from a Once");
    log::set_max_level(log::LevelFilter::Info);
}
