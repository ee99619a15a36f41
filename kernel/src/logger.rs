//! Kernel logger: the `log` facade wired to the serial sink.
//!
//! Lines look like `[ INFO] kernel::memory: message`. The logger holds no
//! lock of its own beyond the serial port's, and the serial path uses
//! `try_lock`, so logging from interrupt context cannot deadlock; a line
//! may be dropped under contention instead.

use conquer_once::spin::OnceCell;
use log::{LevelFilter, Log, Metadata, Record};

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::serial::_print(format_args!(
                "[{:>5}] {}: {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;
static INIT: OnceCell<()> = OnceCell::uninit();

/// Install the logger. Safe to call more than once; only the first call
/// takes effect (hosted tests may already own the global logger).
pub fn init() {
    INIT.get_or_init(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Info);
        }
    });
}

/// Raise or lower the global level filter.
#[allow(dead_code)]
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
