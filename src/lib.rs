//! Runtime heap instrumentation built around a `#[global_allocator]` hook:
//! every allocation gets a tail guard and a captured call stack, every free
//! is delayed long enough to catch use-after-free and tail corruption, and
//! whatever's still live at shutdown is reported as a leak.
//!
//! Install it with [`init`] and report with [`shutdown`]:
//!
//! ```no_run
//! heapwatch::init(heapwatch::Config::default()).expect("install heapwatch");
//! // ... run the program ...
//! heapwatch::shutdown();
//! ```

mod callstack;
mod config;
mod error;
mod hook;
mod output;
mod pool;
mod symbol;
mod tracker;
mod walker;

pub use config::Config;
pub use error::InitError;

use hook::HookShim;

#[global_allocator]
static TRACKER: HookShim = HookShim::new();

/// Installs the hook and begins tracking. `#[global_allocator]` is already
/// wired at compile time; this just flips tracking on and builds the
/// tracker's backing storage. Calling it more than once just updates the
/// configuration.
pub fn init(config: Config) -> Result<(), InitError> {
    TRACKER.init(config)
}

/// Stops tracking and reports every block still live as a leak. Safe to
/// call more than once; only the first call reports.
pub fn shutdown() {
    TRACKER.shutdown();
}
