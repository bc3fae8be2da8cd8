//! Cooperative cancellation.
//!
//! Sessions poll a [`CancelToken`] between reads. While a session runs, the
//! binary holds a [`SigintGuard`] so Ctrl+C ends that session instead of the
//! whole process. Dropping the guard puts the previous SIGINT disposition
//! back, so Ctrl+C at a prompt still exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
#[cfg(unix)]
use log::warn;
#[cfg(unix)]
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
#[cfg(unix)]
use once_cell::sync::OnceCell;

#[cfg(unix)]
use crate::errors::LinkError;
use crate::errors::Result;

#[cfg(unix)]
static SIGINT_FLAG: OnceCell<Arc<AtomicBool>> = OnceCell::new();

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Re-arm the token before the next operation.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Keeps the Ctrl+C hook installed; restores the previous handler on drop.
#[must_use = "the SIGINT hook is removed as soon as the guard is dropped"]
#[derive(Debug)]
pub struct SigintGuard {
    #[cfg(unix)]
    previous: SigAction,
}

#[cfg(unix)]
extern "C" fn on_sigint(_signal: libc::c_int) {
    if let Some(flag) = SIGINT_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Route SIGINT into a fresh, uncancelled token until the guard is dropped.
///
/// `SA_RESTART` is left off so a blocking read returns early.
#[cfg(unix)]
pub fn catch_sigint() -> Result<(SigintGuard, CancelToken)> {
    let token = CancelToken {
        flag: Arc::clone(SIGINT_FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))),
    };
    token.reset();

    let action = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // The handler only touches an atomic in a static.
    let previous = unsafe { sigaction(Signal::SIGINT, &action) }
        .map_err(|e| LinkError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
    debug!("SIGINT handler installed");
    Ok((SigintGuard { previous }, token))
}

/// Without POSIX signals Ctrl+C keeps ending the process; the token is only
/// cancelled programmatically.
#[cfg(not(unix))]
pub fn catch_sigint() -> Result<(SigintGuard, CancelToken)> {
    debug!("no SIGINT hook on this platform, Ctrl+C ends the process");
    Ok((SigintGuard {}, CancelToken::new()))
}

#[cfg(unix)]
impl Drop for SigintGuard {
    fn drop(&mut self) {
        match unsafe { sigaction(Signal::SIGINT, &self.previous) } {
            Ok(_) => debug!("SIGINT handler restored"),
            Err(e) => warn!("failed to restore the SIGINT handler: {e}"),
        }
    }
}
