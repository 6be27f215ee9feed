//! Keyboard interrupt flag shared by the signal handler, the interpreter and
//! the shell wrapper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// The process-wide flag the SIGINT handler sets.
pub fn flag() -> Arc<AtomicBool> {
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false))).clone()
}

pub fn request() {
    flag().store(true, Ordering::SeqCst);
}

pub fn requested() -> bool {
    flag().load(Ordering::SeqCst)
}

#[cfg(unix)]
extern "C" fn on_sigint(_: libc::c_int) {
    // Only an atomic store here; the flag is initialised before installation.
    if let Some(flag) = FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Route SIGINT to the flag instead of terminating the process, so the
/// running step can unwind and record its failure.
#[cfg(unix)]
pub fn install() -> std::io::Result<()> {
    let _ = flag();
    let handler = on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only performs an atomic store.
    let previous = unsafe { libc::signal(libc::SIGINT, handler) };
    if previous == libc::SIG_ERR {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install() -> std::io::Result<()> {
    let _ = flag();
    Ok(())
}
