//! Interrupt handling for the reactor loop.
//!
//! A SIGINT handler sets a process-wide flag; the reactor checks it each
//! poll tick and returns from `run` so connections are torn down on the
//! loop thread instead of mid-syscall.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

static REQUESTED: AtomicBool = AtomicBool::new(false);
static INSTALL: Once = Once::new();

extern "C" fn on_sigint(_signum: libc::c_int) {
    REQUESTED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT handler. Idempotent.
pub fn install() {
    INSTALL.call_once(|| unsafe {
        let handler = on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGINT, handler);
    });
}

/// True once an interrupt has been observed.
pub fn requested() -> bool {
    REQUESTED.load(Ordering::SeqCst)
}
