//! Runtime-adjustable logging.
//!
//! The HTTP runtime commands (`verbose=N`, `console=0|1`) retune the
//! subscriber's level filter through a reload handle; [`LogControl`] keeps
//! the two knobs consistent: console off forces the filter to OFF, console
//! on restores the verbosity-derived level.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::level_filters::LevelFilter;
use tracing::info;

type FilterSetter = dyn Fn(LevelFilter) + Send + Sync;

#[derive(Clone)]
pub struct LogControl {
    set_filter: Arc<FilterSetter>,
    verbosity: Arc<AtomicUsize>,
    console: Arc<AtomicBool>,
}

impl LogControl {
    pub fn new(verbosity: usize, set_filter: Arc<FilterSetter>) -> Self {
        Self {
            set_filter,
            verbosity: Arc::new(AtomicUsize::new(verbosity)),
            console: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A control without a subscriber behind it (tests).
    pub fn disabled() -> Self {
        Self::new(0, Arc::new(|_| {}))
    }

    pub fn set_verbosity(&self, verbosity: usize) {
        info!("SETTING VERBOSE LEVEL TO {verbosity}");
        self.verbosity.store(verbosity, Ordering::Relaxed);
        self.apply();
    }

    pub fn set_console(&self, on: bool) {
        info!("SETTING CONSOLE MODE {}", if on { "ON" } else { "OFF" });
        self.console.store(on, Ordering::Relaxed);
        self.apply();
    }

    fn apply(&self) {
        let filter = if self.console.load(Ordering::Relaxed) {
            level_for(self.verbosity.load(Ordering::Relaxed))
        } else {
            LevelFilter::OFF
        };
        (self.set_filter)(filter);
    }
}

impl std::fmt::Debug for LogControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogControl")
            .field("verbosity", &self.verbosity.load(Ordering::Relaxed))
            .field("console", &self.console.load(Ordering::Relaxed))
            .finish()
    }
}

/// Maps the stackable `-v` count onto tracing levels.
pub fn level_for(verbosity: usize) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}
