//! Process-wide run context and lifecycle
//!
//! A [`Session`] is created once at startup and lives for the rest of the
//! process, so the signal handler can hold a `&'static` reference to it.
//! [`Session::run`] drives one command from pty allocation to its final
//! exit status.

use std::ffi::OsString;
use std::io;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::Config;
use crate::error::{ExitOutcome, Result};
use crate::pty::{Child, Command, LineDiscipline, PtyPair};
use crate::relay::{Endpoints, Relay};
use crate::signals;
use crate::terminal::{EchoGuard, RestoreOnDrop};

/// State shared between the main flow and the signal handler
pub struct Session {
    config: Config,
    /// Pid of the running child, 0 when there is none
    child: AtomicI32,
    terminal: EchoGuard,
}

impl Session {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            child: AtomicI32::new(0),
            terminal: EchoGuard::stdin(),
        }
    }

    /// Create a session that lives until the process exits
    pub fn leak(config: Config) -> &'static Self {
        Box::leak(Box::new(Self::new(config)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Pid of the running child, if any
    pub fn child_pid(&self) -> Option<Pid> {
        match self.child.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(Pid::from_raw(pid)),
        }
    }

    pub fn terminal(&self) -> &EchoGuard {
        &self.terminal
    }

    /// Run `argv` on a fresh pty and relay until it is done.
    ///
    /// On error the child (if any) is sent SIGTERM and the terminal is
    /// restored before returning.
    pub fn run(&'static self, argv: &[OsString]) -> Result<ExitOutcome> {
        let command = Command::from_argv(argv)?;
        let discipline = LineDiscipline::new(self.config.line_ending());

        let mut pair = PtyPair::open(discipline)?;
        let mut child = Child::spawn(&mut pair, &command, self.config.quiet)?;
        self.child.store(child.pid().as_raw(), Ordering::SeqCst);

        signals::install(self)?;

        let _restore = RestoreOnDrop(&self.terminal);
        if self.config.no_echo && self.terminal.suppress_echo()? {
            log::debug!("Echo suppressed on controlling terminal");
        }

        let stdin = io::stdin();
        let stdout = io::stdout();
        let endpoints = Endpoints {
            master: pair.master(),
            input: stdin.as_fd(),
            output: stdout.as_fd(),
        };
        Relay::new(endpoints, self.config.relay_settings()).run()?;

        let outcome = child.wait()?;
        self.child.store(0, Ordering::SeqCst);

        // Only now: closing the master earlier would hang up the child
        drop(pair);

        Ok(outcome)
    }

    /// Called from the signal handler: forward and restore.
    pub(crate) fn on_termination(&self, signal: Signal) {
        if let Some(pid) = self.child_pid() {
            let _ = kill(pid, signal);
        }
        self.terminal.restore_in_handler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_has_no_child() {
        let session = Session::new(Config::default());
        assert!(session.child_pid().is_none());
        assert!(!session.terminal().is_armed());
    }

    #[test]
    fn test_on_termination_without_child_is_harmless() {
        let session = Session::new(Config::default());
        session.on_termination(Signal::SIGTERM);
        assert!(!session.terminal().is_armed());
    }
}
