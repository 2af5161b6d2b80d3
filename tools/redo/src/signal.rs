//! Interrupt (SIGINT) tracking.
//!
//! The handler only records that an interrupt arrived. Recipes share the
//! terminal's process group, so they receive the signal themselves and exit.
//! The build then refuses to commit anything, and the driver winds down and
//! exits with [`INTERRUPTED_EXIT`].

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};

/// Exit status after a user interrupt.
pub const INTERRUPTED_EXIT: i32 = 200;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signum: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT handler for this process.
pub fn install() -> Result<()> {
    let handler: extern "C" fn(libc::c_int) = on_sigint;
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
        bail!("failed to install SIGINT handler: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

/// Whether an interrupt has been received.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
