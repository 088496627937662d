//! Diagnostic logging for the simulation engine.
//!
//! Log messages report what the engine does: model loading, the start and end of a run, each
//! completed iteration, per-edge outflow and every clamped violation. Simulation output is not
//! logged; it goes through [`crate::report`].
//!
//! The `log` crate's macros are re-exported so models and drivers can log through the same
//! backend:
//!
//! ```rust
//! use stageflow::log::info;
//!
//! pub fn seed_outbreak() {
//!     info!("Seeding the first infections.");
//! }
//! ```
//!
//! Nothing is printed until a level is set, either with `--log-level <level>` on the `stageflow`
//! binary or from code. Per-module levels override the global one:
//!
//! ```rust
//! use stageflow::log::{set_log_level, set_module_filter, LevelFilter};
//!
//! pub fn setup_logging() {
//!     set_log_level(LevelFilter::Info);
//!     // Per-edge outflow, every iteration
//!     set_module_filter("stageflow::compartment", LevelFilter::Trace);
//! }
//! ```
#[cfg(feature = "logging")]
mod standard_logger;

#[cfg(not(feature = "logging"))]
mod null_logger;

pub use log::{debug, error, info, trace, warn, LevelFilter};
use std::collections::hash_map::Entry;

use crate::HashMap;
#[cfg(feature = "logging")]
use log4rs::Handle;
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Off;
// Per-edge trace messages are only shown when asked for explicitly.
const DEFAULT_MODULE_FILTERS: [(&str, LevelFilter); 1] =
    [("stageflow::compartment", LevelFilter::Debug)];

static LOG_SETTINGS: LazyLock<Mutex<LogSettings>> = LazyLock::new(Mutex::default);

/// Maximum level for messages whose target starts with `module`.
#[derive(Debug, PartialEq)]
struct ModuleFilter {
    module: String,
    level: LevelFilter,
}

impl From<(&str, LevelFilter)> for ModuleFilter {
    fn from((module, level): (&str, LevelFilter)) -> Self {
        Self {
            module: module.to_string(),
            level,
        }
    }
}

/// Process-wide logging state. The backend is installed on the first change and reconfigured
/// on every later one.
#[derive(Debug)]
pub(in crate::log) struct LogSettings {
    /// Applies to every module without its own filter. `Off` silences them.
    pub(in crate::log) level: LevelFilter,
    pub(in crate::log) module_filters: HashMap<String, ModuleFilter>,

    #[cfg(feature = "logging")]
    handle: Option<Handle>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL,
            module_filters: DEFAULT_MODULE_FILTERS
                .into_iter()
                .map(|filter| (filter.0.to_string(), filter.into()))
                .collect(),

            #[cfg(feature = "logging")]
            handle: None,
        }
    }
}

impl LogSettings {
    // True if the filter changed.
    fn upsert(&mut self, module: &str, level: LevelFilter) -> bool {
        match self.module_filters.entry(module.to_string()) {
            Entry::Occupied(mut entry) if entry.get().level != level => {
                entry.get_mut().level = level;
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert((module, level).into());
                true
            }
        }
    }

    fn update(&mut self, change: impl FnOnce(&mut Self) -> bool) {
        if change(self) {
            self.apply();
        }
    }
}

fn settings() -> MutexGuard<'static, LogSettings> {
    LOG_SETTINGS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shows every message. Same as `set_log_level(LevelFilter::Trace)`.
pub fn enable_logging() {
    set_log_level(LevelFilter::Trace);
}

/// Same as `set_log_level(LevelFilter::Off)`.
pub fn disable_logging() {
    set_log_level(LevelFilter::Off);
}

pub fn set_log_level(level: LevelFilter) {
    settings().update(|settings| {
        settings.level = level;
        true
    });
}

pub fn set_module_filter(module_path: &str, level: LevelFilter) {
    settings().update(|settings| settings.upsert(module_path, level));
}

/// Sets several module filters, reconfiguring the backend once.
pub fn set_module_filters(filters: &[(&str, LevelFilter)]) {
    settings().update(|settings| {
        filters
            .iter()
            .fold(false, |changed, (module, level)| {
                settings.upsert(module, *level) | changed
            })
    });
}

/// Lets the global level apply to `module_path` again.
pub fn remove_module_filter(module_path: &str) {
    settings().update(|settings| settings.module_filters.remove(module_path).is_some());
}
