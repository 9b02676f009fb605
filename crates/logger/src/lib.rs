//! Logger
//!
//! A `log` backend that writes records to the console registered by the platform. Records emitted
//! before a console is registered are dropped.
#![cfg_attr(not(test), no_std)]

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Metadata, Record};
use spin::Mutex;

static LOGGER: LockedLogger = LockedLogger(Mutex::new(Logger { console: None }));
static IS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// An output device, provided by platform bring-up (typically a UART).
pub trait Console: Sync {
    fn write_fmt(&self, args: fmt::Arguments);
}

struct LockedLogger(Mutex<Logger>);

struct Logger {
    console: Option<&'static dyn Console>,
}

impl log::Log for LockedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.0.lock().enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.0.lock().log(record)
    }

    fn flush(&self) {}
}

impl Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        self.console.is_some()
    }

    fn log(&self, record: &Record) {
        if let Some(console) = self.console {
            console.write_fmt(core::format_args!(
                "[{} | {}] {}\n",
                record.level(),
                record.target(),
                record.args()
            ))
        }
    }
}

pub fn init(level: LevelFilter) {
    match IS_INITIALIZED.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => match log::set_logger(&LOGGER) {
            Ok(()) => log::set_max_level(level),
            // Another backend got installed first, keep it
            Err(_) => IS_INITIALIZED.store(false, Ordering::SeqCst),
        },
        Err(_) => {
            log::warn!("Logger is already initialized, skipping init");
        }
    };
}

/// Routes all subsequent records to `console`.
pub fn register_console(console: &'static dyn Console) {
    LOGGER.0.lock().console = Some(console);
}
