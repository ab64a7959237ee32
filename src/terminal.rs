//! Echo suppression on the parent's controlling terminal
//!
//! The pty slave never echoes, but the terminal the user is typing into
//! still does. [`EchoGuard`] turns that echo off for the duration of a run
//! and puts the saved mode back on every exit path, including from a
//! signal handler. Restoration is idempotent.
//!
//! The snapshot is a plain `libc::termios` written back with
//! `libc::tcsetattr`, so the normal path and the signal handler can both
//! read it at once.

use std::mem::MaybeUninit;
use std::os::fd::{BorrowedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use libc::STDIN_FILENO;
use nix::errno::Errno;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
use nix::unistd::isatty;

use crate::error::{Error, Result};
use crate::signals;

/// Saved terminal mode for one descriptor
///
/// The snapshot is stored behind an atomic pointer so the signal handler
/// can reach it without taking a lock.
pub struct EchoGuard {
    fd: RawFd,
    saved: AtomicPtr<libc::termios>,
}

impl EchoGuard {
    /// Guard for the terminal on `fd`; nothing is changed until
    /// [`suppress_echo`](Self::suppress_echo) is called.
    pub const fn new(fd: RawFd) -> Self {
        Self {
            fd,
            saved: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Guard for the parent's standard input
    pub const fn stdin() -> Self {
        Self::new(STDIN_FILENO)
    }

    /// Whether a snapshot is held and will be restored
    pub fn is_armed(&self) -> bool {
        !self.saved.load(Ordering::SeqCst).is_null()
    }

    /// Turn echo off if `fd` is a terminal that currently echoes.
    ///
    /// Returns `true` if the mode was changed. The termination signals are
    /// blocked while the snapshot is taken and the new mode applied.
    pub fn suppress_echo(&self) -> Result<bool> {
        if self.is_armed() || !isatty(self.fd).unwrap_or(false) {
            return Ok(false);
        }

        let fd = self.borrowed();
        let mut silent: Termios = termios::tcgetattr(fd).map_err(Error::termios("tcgetattr"))?;
        if !silent.local_flags.contains(LocalFlags::ECHO) {
            log::debug!("Terminal echo already off, leaving it alone");
            return Ok(false);
        }
        let original = snapshot(self.fd).map_err(Error::termios("tcgetattr"))?;
        silent.local_flags.remove(LocalFlags::ECHO);

        let blocked = signals::termination_set();
        let mut previous = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut previous))
            .map_err(Error::signal("sigprocmask"))?;

        let applied = termios::tcsetattr(fd, SetArg::TCSANOW, &silent);
        if applied.is_ok() {
            self.saved
                .store(Box::into_raw(Box::new(original)), Ordering::SeqCst);
        }

        sigprocmask(SigmaskHow::SIG_SETMASK, Some(&previous), None)
            .map_err(Error::signal("sigprocmask"))?;
        applied.map_err(Error::termios("tcsetattr"))?;

        log::debug!("Echo suppressed on fd {}", self.fd);
        Ok(true)
    }

    /// Put the saved mode back. Does nothing if no snapshot is held, so it
    /// may be called any number of times.
    pub fn restore(&self) {
        let saved = self.saved.load(Ordering::SeqCst);
        if saved.is_null() {
            return;
        }

        // SAFETY: non-null pointers in `saved` come from Box::into_raw and
        // are only freed after being swapped out below.
        apply(self.fd, unsafe { &*saved });

        if self
            .saved
            .compare_exchange(saved, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // SAFETY: we won the exchange, so no one else can reach it
            drop(unsafe { Box::from_raw(saved) });
            log::debug!("Terminal mode restored on fd {}", self.fd);
        }
    }

    /// Restore from inside a signal handler: no logging, no freeing.
    pub(crate) fn restore_in_handler(&self) {
        let saved = self.saved.swap(ptr::null_mut(), Ordering::SeqCst);
        if !saved.is_null() {
            // SAFETY: see `restore`; the snapshot is leaked on purpose
            apply(self.fd, unsafe { &*saved });
        }
    }

    fn borrowed(&self) -> BorrowedFd<'_> {
        // SAFETY: the guard is only used while `fd` is open
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

/// Current mode of `fd` as the C struct
fn snapshot(fd: RawFd) -> nix::Result<libc::termios> {
    let mut raw = MaybeUninit::<libc::termios>::uninit();
    // SAFETY: tcgetattr fills the whole struct on success
    Errno::result(unsafe { libc::tcgetattr(fd, raw.as_mut_ptr()) })?;
    Ok(unsafe { raw.assume_init() })
}

/// Write `mode` back to `fd`. Async-signal-safe, errors are ignored.
fn apply(fd: RawFd, mode: &libc::termios) {
    // SAFETY: `mode` is a valid termios for the duration of the call
    unsafe { libc::tcsetattr(fd, libc::TCSANOW, mode) };
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Restores an [`EchoGuard`] when dropped
pub struct RestoreOnDrop<'a>(pub &'a EchoGuard);

impl Drop for RestoreOnDrop<'_> {
    fn drop(&mut self) {
        self.0.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::{LineDiscipline, PtyPair};
    use std::os::fd::{AsFd, AsRawFd};

    fn echo_on(fd: BorrowedFd<'_>) -> bool {
        termios::tcgetattr(fd)
            .unwrap()
            .local_flags
            .contains(LocalFlags::ECHO)
    }

    fn set_echo(fd: BorrowedFd<'_>, on: bool) {
        let mut attrs = termios::tcgetattr(fd).unwrap();
        attrs.local_flags.set(LocalFlags::ECHO, on);
        termios::tcsetattr(fd, SetArg::TCSANOW, &attrs).unwrap();
    }

    #[test]
    fn test_not_a_tty_is_left_alone() {
        let (read_end, _write_end) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();
        let guard = EchoGuard::new(read_end.as_raw_fd());
        assert!(!guard.suppress_echo().unwrap());
        assert!(!guard.is_armed());
        guard.restore();
    }

    #[test]
    fn test_suppress_and_restore() {
        let mut pair = PtyPair::open(LineDiscipline::default()).unwrap();
        let tty = pair.take_slave().unwrap();
        set_echo(tty.as_fd(), true);

        let guard = EchoGuard::new(tty.as_raw_fd());
        assert!(guard.suppress_echo().unwrap());
        assert!(guard.is_armed());
        assert!(!echo_on(tty.as_fd()));

        guard.restore();
        assert!(!guard.is_armed());
        assert!(echo_on(tty.as_fd()));

        // Second restore is a no-op
        guard.restore();
        assert!(echo_on(tty.as_fd()));
    }

    #[test]
    fn test_echo_already_off_is_not_armed() {
        let mut pair = PtyPair::open(LineDiscipline::default()).unwrap();
        let tty = pair.take_slave().unwrap();
        set_echo(tty.as_fd(), false);

        let guard = EchoGuard::new(tty.as_raw_fd());
        assert!(!guard.suppress_echo().unwrap());
        assert!(!guard.is_armed());
    }

    #[test]
    fn test_handler_restore_then_normal_restore() {
        let mut pair = PtyPair::open(LineDiscipline::default()).unwrap();
        let tty = pair.take_slave().unwrap();
        set_echo(tty.as_fd(), true);

        let guard = EchoGuard::new(tty.as_raw_fd());
        guard.suppress_echo().unwrap();
        guard.restore_in_handler();
        assert!(echo_on(tty.as_fd()));
        assert!(!guard.is_armed());

        guard.restore();
        assert!(echo_on(tty.as_fd()));
    }

    #[test]
    fn test_handler_restore_while_snapshot_in_use() {
        let mut pair = PtyPair::open(LineDiscipline::default()).unwrap();
        let tty = pair.take_slave().unwrap();
        set_echo(tty.as_fd(), true);

        let guard = EchoGuard::new(tty.as_raw_fd());
        guard.suppress_echo().unwrap();

        // The normal path holds a reference to the snapshot when the
        // handler runs; both must be able to apply it.
        let saved = guard.saved.load(Ordering::SeqCst);
        let in_use = unsafe { &*saved };
        guard.restore_in_handler();
        apply(tty.as_raw_fd(), in_use);

        assert!(echo_on(tty.as_fd()));
        assert!(!guard.is_armed());
        guard.restore();
        assert!(echo_on(tty.as_fd()));

        // Leaked by restore_in_handler; reclaim it here
        drop(unsafe { Box::from_raw(saved) });
    }

    #[test]
    fn test_restore_on_drop() {
        let mut pair = PtyPair::open(LineDiscipline::default()).unwrap();
        let tty = pair.take_slave().unwrap();
        set_echo(tty.as_fd(), true);

        let guard = EchoGuard::new(tty.as_raw_fd());
        {
            let _restore = RestoreOnDrop(&guard);
            guard.suppress_echo().unwrap();
            assert!(!echo_on(tty.as_fd()));
        }
        assert!(echo_on(tty.as_fd()));
    }
}
