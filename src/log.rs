use log::{LevelFilter, Log, Metadata, Record};
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG: AtomicBool = AtomicBool::new(false);

#[inline(always)]
pub fn is_debug_enabled() -> bool {
    DEBUG.load(Ordering::SeqCst)
}

/// Raise stopcast's own records to `debug` level, regardless of `RUST_LOG`.
pub fn enable_debug() {
    DEBUG.store(true, Ordering::SeqCst)
}

/// Restore the filter taken from the environment.
pub fn disable_debug() {
    DEBUG.store(false, Ordering::SeqCst)
}

/// Logger that switches between the environment-configured filter and a verbose one.
pub struct SwitchLogger {
    normal: env_logger::Logger,
    verbose: env_logger::Logger,
}

impl SwitchLogger {
    pub fn from_default_env() -> Self {
        let env = env_logger::Env::default().default_filter_or("info");
        let normal = env_logger::Builder::from_env(env).build();

        let env = env_logger::Env::default().default_filter_or("info");
        let verbose = env_logger::Builder::from_env(env)
            .filter_module(env!("CARGO_CRATE_NAME"), LevelFilter::Debug)
            .build();

        Self { normal, verbose }
    }

    pub fn filter(&self) -> LevelFilter {
        self.normal.filter().max(self.verbose.filter())
    }

    fn current(&self) -> &env_logger::Logger {
        if is_debug_enabled() {
            &self.verbose
        } else {
            &self.normal
        }
    }
}

impl Log for SwitchLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.current().enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.current().log(record)
    }

    fn flush(&self) {
        self.current().flush()
    }
}

/// Install [`SwitchLogger`] as the global logger. Repeated calls are no-op.
pub fn init() {
    let logger = SwitchLogger::from_default_env();
    let filter = logger.filter();
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(filter);
    }
}
