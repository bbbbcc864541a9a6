//! Process-wide stop flag raised by SIGINT/SIGTERM.

use crate::errors::CuesyncError;
use std::sync::atomic::{AtomicBool, Ordering};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn stop_flag() -> &'static AtomicBool {
    &STOP_REQUESTED
}

pub fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::SeqCst)
}

#[cfg(unix)]
extern "C" fn on_stop_signal(_signal: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM to the stop flag instead of the default exit.
#[cfg(unix)]
pub fn install_stop_handlers() -> Result<(), CuesyncError> {
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
        let previous = unsafe {
            libc::signal(
                signal,
                on_stop_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
            )
        };
        if previous == libc::SIG_ERR {
            return Err(CuesyncError::Io(format!(
                "failed to install handler for signal {signal}"
            )));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install_stop_handlers() -> Result<(), CuesyncError> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn sigterm_raises_the_stop_flag() {
        install_stop_handlers().expect("install");
        assert!(!stop_requested());
        // SAFETY: raising a signal at ourselves with a handler installed.
        let rc = unsafe { libc::raise(libc::SIGTERM) };
        assert_eq!(rc, 0);
        assert!(stop_requested());
        assert!(stop_flag().load(Ordering::SeqCst));
        STOP_REQUESTED.store(false, Ordering::SeqCst);
    }
}
