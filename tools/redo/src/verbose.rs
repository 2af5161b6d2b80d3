//! Diagnostic output for redo processes.
//!
//! Everything goes to stderr: a recipe's stdout is captured as its target's
//! content, so nothing here may ever write to stdout.
//!
//! Levels, set once at startup from the build context:
//! - **Default**: one `redo  <target>` line per built target, plus errors
//! - **Verbose** (`-v`): recipes run under `sh -v`, and finished targets
//!   report their elapsed time
//! - **Debug** (`-d`, `-dd`): dependency checks and do-file probes

use std::fmt::Display;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Instant;

use crossterm::style::{Stylize, style};
use crossterm::tty::IsTty;

static DEBUG_LEVEL: AtomicU8 = AtomicU8::new(0);
static VERBOSE: AtomicBool = AtomicBool::new(false);
static DEPTH: AtomicUsize = AtomicUsize::new(0);
static COLOR: AtomicBool = AtomicBool::new(false);

/// Initialize output settings for the current process.
pub fn init(debug: u8, verbose: bool, depth: usize) {
    DEBUG_LEVEL.store(debug, Ordering::Relaxed);
    VERBOSE.store(verbose, Ordering::Relaxed);
    DEPTH.store(depth, Ordering::Relaxed);
    COLOR.store(std::io::stderr().is_tty(), Ordering::Relaxed);
}

/// Returns the active debug level (0 = off).
pub fn debug_level() -> u8 {
    DEBUG_LEVEL.load(Ordering::Relaxed)
}

/// Returns `true` if verbose mode is active.
pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Indentation for the current recursion depth.
fn indent() -> String {
    "  ".repeat(DEPTH.load(Ordering::Relaxed))
}

/// Print a target line: `redo  <indent><msg>`.
pub fn log_target(msg: impl Display) {
    let prefix = if COLOR.load(Ordering::Relaxed) {
        style("redo").green().bold().to_string()
    } else {
        "redo".to_string()
    };
    let line = format!("{prefix}  {}{msg}\n", indent());
    let _ = std::io::stderr().lock().write_all(line.as_bytes());
}

/// Print an error line: `redo: <indent><msg>`.
pub fn err(msg: impl Display) {
    let prefix = if COLOR.load(Ordering::Relaxed) {
        style("redo:").red().bold().to_string()
    } else {
        "redo:".to_string()
    };
    let line = format!("{prefix} {}{msg}\n", indent());
    let _ = std::io::stderr().lock().write_all(line.as_bytes());
}

/// Write a debug line unconditionally; callers gate on [`debug_level`].
pub fn debug_line(msg: impl Display) {
    let line = format!("redo: {}{msg}\n", indent());
    let _ = std::io::stderr().lock().write_all(line.as_bytes());
}

/// Print a message when debug output (`-d`) is enabled.
///
/// Usage mirrors `println!`:
/// ```ignore
/// dprintln!("{target}: dirty (no stamp)");
/// ```
macro_rules! dprintln {
    ($($arg:tt)*) => {
        if $crate::verbose::debug_level() >= 1 {
            $crate::verbose::debug_line(format_args!($($arg)*));
        }
    };
}

pub(crate) use dprintln;

/// Print a message only at the second debug level (`-dd`).
macro_rules! ddprintln {
    ($($arg:tt)*) => {
        if $crate::verbose::debug_level() >= 2 {
            $crate::verbose::debug_line(format_args!($($arg)*));
        }
    };
}

pub(crate) use ddprintln;

/// RAII timer that reports `<label> (done)` on drop when verbose mode is active.
///
/// ```ignore
/// let _t = Timer::start(target.display_name());
/// // ... run the recipe ...
/// // prints "redo  hello.o (done, 42.0ms)" on drop
/// ```
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    /// Begin timing a labeled operation.
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            start: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if is_verbose() {
            log_target(format_args!(
                "{} (done, {:.1?})",
                self.label,
                self.start.elapsed()
            ));
        }
    }
}
