//! Termination signal handling
//!
//! On SIGHUP, SIGINT, SIGQUIT or SIGTERM the parent forwards the signal to
//! the child, restores its terminal and then dies from the same signal so
//! whoever waits on it sees the real cause. Handlers are reset to the
//! default disposition on first delivery.

use std::sync::OnceLock;

use libc::c_int;
use nix::sys::signal::{raise, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{Error, Result};
use crate::session::Session;

/// Signals that are forwarded to the child
pub const TERMINATION_SIGNALS: [Signal; 4] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
];

/// The session the handler acts on, set once by [`install`]
static SESSION: OnceLock<&'static Session> = OnceLock::new();

/// Set containing all [`TERMINATION_SIGNALS`]
pub fn termination_set() -> SigSet {
    let mut set = SigSet::empty();
    for signal in TERMINATION_SIGNALS {
        set.add(signal);
    }
    set
}

/// Route the termination signals to `session`.
///
/// Only the first installed session is used by the handler.
pub fn install(session: &'static Session) -> Result<()> {
    if SESSION.set(session).is_err() {
        log::warn!("Signal handlers already bound to a session");
    }

    let action = SigAction::new(
        SigHandler::Handler(on_termination),
        SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    for signal in TERMINATION_SIGNALS {
        // SAFETY: the handler only does async-signal-safe work: kill,
        // tcsetattr and raise, plus atomic loads.
        unsafe { sigaction(signal, &action) }.map_err(Error::signal("sigaction"))?;
    }

    log::debug!("Termination signal handlers installed");
    Ok(())
}

extern "C" fn on_termination(signum: c_int) {
    let Ok(signal) = Signal::try_from(signum) else {
        return;
    };

    if let Some(session) = SESSION.get() {
        session.on_termination(signal);
    }

    // The disposition is back to default and the signal is blocked while
    // we run, so this terminates us as soon as the handler returns.
    let _ = raise(signal);
}
