//! Error types and exit-status mapping
//!
//! Every failure during setup or relaying is fatal and ends the program
//! with [`SETUP_FAILURE`]. A child that dies abnormally is not an error;
//! its outcome is mapped through [`ExitOutcome::status`].

use nix::sys::signal::Signal;
use thiserror::Error;

/// Exit status for any failing system call or setup step
pub const SETUP_FAILURE: i32 = 127;

/// Offset added to a signal number when the child was killed by it
pub const SIGNAL_EXIT_BASE: i32 = 128;

/// ptyexec error type
///
/// Each variant names the operation that failed so the diagnostic on
/// stderr tells the user where things went wrong.
#[derive(Error, Debug)]
pub enum Error {
    #[error("posix_openpt() error: {0}")]
    OpenMaster(#[source] nix::Error),

    #[error("grantpt() error: {0}")]
    Grant(#[source] nix::Error),

    #[error("unlockpt() error: {0}")]
    Unlock(#[source] nix::Error),

    #[error("ptsname() error: {0}")]
    SlaveName(#[source] nix::Error),

    #[error("open() error on {path}: {source}")]
    OpenSlave {
        path: String,
        #[source]
        source: nix::Error,
    },

    #[error("{op}() error: {source}")]
    Termios {
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("fcntl() error: {0}")]
    Fcntl(#[source] nix::Error),

    #[error("fork() error: {0}")]
    Fork(#[source] nix::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{op}() error: {source}")]
    Signal {
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("poll() error: {0}")]
    Poll(#[source] nix::Error),

    #[error("read() error: {0}")]
    Read(#[source] nix::Error),

    #[error("write() error: {0}")]
    Write(#[source] nix::Error),

    #[error("waitpid() error: {0}")]
    Wait(#[source] nix::Error),

    #[error("{0}")]
    Config(String),
}

impl Error {
    /// Exit status the program terminates with after this error
    pub fn exit_code(&self) -> i32 {
        SETUP_FAILURE
    }

    pub(crate) fn termios(op: &'static str) -> impl FnOnce(nix::Error) -> Self {
        move |source| Error::Termios { op, source }
    }

    pub(crate) fn signal(op: &'static str) -> impl FnOnce(nix::Error) -> Self {
        move |source| Error::Signal { op, source }
    }
}

/// Result type for ptyexec operations
pub type Result<T> = std::result::Result<T, Error>;

/// How the child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The child called exit() with this code
    ExitedWithCode(i32),
    /// The child was terminated by this signal
    KilledBySignal(Signal),
}

impl ExitOutcome {
    /// Exit status the parent reports for this outcome
    pub fn status(self) -> i32 {
        match self {
            ExitOutcome::ExitedWithCode(code) => code,
            ExitOutcome::KilledBySignal(signal) => SIGNAL_EXIT_BASE + signal as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_is_passed_through() {
        assert_eq!(ExitOutcome::ExitedWithCode(0).status(), 0);
        assert_eq!(ExitOutcome::ExitedWithCode(3).status(), 3);
    }

    #[test]
    fn test_signal_outcome_adds_base() {
        assert_eq!(ExitOutcome::KilledBySignal(Signal::SIGKILL).status(), 137);
        assert_eq!(ExitOutcome::KilledBySignal(Signal::SIGTERM).status(), 143);
    }

    #[test]
    fn test_errors_map_to_setup_failure() {
        let err = Error::Poll(nix::Error::EBADF);
        assert_eq!(err.exit_code(), 127);
        assert!(err.to_string().starts_with("poll() error"));

        let err = Error::termios("tcsetattr")(nix::Error::ENOTTY);
        assert_eq!(err.exit_code(), SETUP_FAILURE);
        assert!(err.to_string().starts_with("tcsetattr() error"));
    }
}
