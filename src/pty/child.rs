//! Child process launching and reaping
//!
//! The child starts a new session, takes the pty slave as its controlling
//! terminal, binds its standard streams to it and execs the command.
//! Failures after the fork are reported by the child itself on its
//! stderr, followed by exit status 127.

use std::ffi::{CStr, CString, OsStr};
use std::os::fd::{BorrowedFd, RawFd};
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::ptr;

use libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::signal::{self, kill, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, fork, setsid, write, ForkResult, Pid};

use crate::error::{Error, ExitOutcome, Result, SETUP_FAILURE};
use crate::pty::{LineDiscipline, PtyPair};

/// Program name prefixed to diagnostics written by the forked child
const PROGRAM_NAME: &str = "ptyexec";

/// Dispositions put back to default before exec. The Rust runtime
/// ignores SIGPIPE and ignored signals survive exec.
const RESET_SIGNALS: [Signal; 6] = [
    Signal::SIGPIPE,
    Signal::SIGCHLD,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
];

/// Command line to exec in the child, converted before forking
#[derive(Debug, Clone)]
pub struct Command {
    program: CString,
    argv: Vec<CString>,
}

impl Command {
    /// Build a command from a program name and its arguments.
    ///
    /// The program is looked up in `PATH` at exec time and is also
    /// passed as `argv[0]`.
    pub fn new<P, I, S>(program: P, args: I) -> Result<Self>
    where
        P: AsRef<OsStr>,
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = to_cstring(program.as_ref())?;
        let mut argv = vec![program.clone()];
        for arg in args {
            argv.push(to_cstring(arg.as_ref())?);
        }
        Ok(Self { program, argv })
    }

    /// Build a command from a full argv vector (`argv[0]` is the program)
    pub fn from_argv<S: AsRef<OsStr>>(argv: &[S]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::InvalidArgument("no command given".to_string()))?;
        Self::new(program, args)
    }

    pub fn program(&self) -> &CStr {
        &self.program
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    /// NULL-terminated pointer array for execvp(3), borrowing from `self`
    fn argv_ptrs(&self) -> Vec<*const c_char> {
        self.argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect()
    }
}

fn to_cstring(s: &OsStr) -> Result<CString> {
    CString::new(s.as_bytes())
        .map_err(|_| Error::InvalidArgument(format!("{:?} contains a NUL byte", s)))
}

/// A child process running on the pty slave
#[derive(Debug)]
pub struct Child {
    pid: Pid,
    outcome: Option<ExitOutcome>,
}

impl Child {
    /// Fork and exec `command` on the slave of `pair`.
    ///
    /// The parent's copy of the slave is released before returning.
    /// `quiet` suppresses the child's own diagnostic if it fails before
    /// the exec.
    pub fn spawn(pair: &mut PtyPair, command: &Command, quiet: bool) -> Result<Self> {
        let slave_path = pair.slave_path_cstr()?;
        let discipline = pair.discipline();
        let master = pair.master_raw();
        let slave = pair.slave_raw();
        let argv = command.argv_ptrs();

        // SAFETY: the child only performs async-signal-safe work between
        // fork and exec; every allocation, including the exec argument
        // array, happened above.
        match unsafe { fork() }.map_err(Error::Fork)? {
            ForkResult::Parent { child } => {
                pair.release_slave();
                log::debug!("Spawned child {} on {}", child, pair.slave_path());
                Ok(Self {
                    pid: child,
                    outcome: None,
                })
            }
            ForkResult::Child => {
                let setup = ChildSetup {
                    slave_path: &slave_path,
                    discipline,
                    master,
                    slave,
                    quiet,
                };
                setup.exec(command.program(), &argv)
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether the final status has already been collected
    pub fn is_reaped(&self) -> bool {
        self.outcome.is_some()
    }

    /// Block until the child terminates and return how it ended.
    ///
    /// The status is collected from the kernel once; later calls return
    /// the cached outcome.
    pub fn wait(&mut self) -> Result<ExitOutcome> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }

        let outcome = loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => break ExitOutcome::ExitedWithCode(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => break ExitOutcome::KilledBySignal(signal),
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Wait(e)),
            }
        };

        log::debug!("Child {} finished: {:?}", self.pid, outcome);
        self.outcome = Some(outcome);
        Ok(outcome)
    }

    /// Send a signal to the child; a no-op once it has been reaped
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if self.is_reaped() {
            return Ok(());
        }
        kill(self.pid, signal).map_err(Error::signal("kill"))
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        // Unwinding from a fatal error: don't leave the child running on
        // a pty nobody services.
        if !self.is_reaped() {
            let _ = self.signal(Signal::SIGTERM);
        }
    }
}

/// Everything the forked child needs, captured before the fork
struct ChildSetup<'a> {
    slave_path: &'a CStr,
    discipline: LineDiscipline,
    master: RawFd,
    slave: Option<RawFd>,
    quiet: bool,
}

impl ChildSetup<'_> {
    fn exec(&self, program: &CStr, argv: &[*const c_char]) -> ! {
        if let Err(e) = setsid() {
            self.fail("setsid", e);
        }

        // A session leader without a controlling terminal acquires the
        // first terminal it opens.
        let tty = match open(self.slave_path, OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(e) => self.fail("open", e),
        };

        // SAFETY: TIOCSCTTY on a terminal we just opened. Where opening
        // already made it the controlling terminal this is a no-op.
        unsafe {
            libc::ioctl(tty, libc::TIOCSCTTY as _, 0);
        }

        // SAFETY: `tty` stays open until the dup2 calls below are done
        let borrowed = unsafe { BorrowedFd::borrow_raw(tty) };
        if let Err((op, errno)) = self.discipline.configure_raw(borrowed) {
            self.fail(op, errno);
        }

        for target in [STDIN_FILENO, STDOUT_FILENO, STDERR_FILENO] {
            if let Err(e) = dup2(tty, target) {
                self.fail("dup2", e);
            }
        }

        if tty > STDERR_FILENO {
            if let Err(e) = close(tty) {
                self.fail("close", e);
            }
        }
        if let Some(slave) = self.slave.filter(|fd| *fd > STDERR_FILENO) {
            if let Err(e) = close(slave) {
                self.fail("close", e);
            }
        }
        if let Err(e) = close(self.master) {
            self.fail("close", e);
        }

        for sig in RESET_SIGNALS {
            // SAFETY: installing SIG_DFL runs no handler code
            if let Err(e) = unsafe { signal::signal(sig, SigHandler::SigDfl) } {
                self.fail("signal", e);
            }
        }

        // SAFETY: `argv` is NULL-terminated and points into CStrings that
        // outlive this call; execvp only returns on failure.
        unsafe { libc::execvp(program.as_ptr(), argv.as_ptr()) };
        self.fail("execvp", Errno::last())
    }

    /// Report a failed step on stderr and terminate the child.
    ///
    /// Writes pieces directly so nothing is allocated after the fork.
    fn fail(&self, op: &str, errno: Errno) -> ! {
        if !self.quiet {
            // SAFETY: fd 2 is open for the lifetime of the process
            let stderr = unsafe { BorrowedFd::borrow_raw(STDERR_FILENO) };
            for part in [PROGRAM_NAME, ": ", op, "() error: ", errno.desc(), "\n"] {
                let _ = write(stderr, part.as_bytes());
            }
        }
        // SAFETY: _exit skips atexit handlers and stdio buffers inherited
        // from the parent, which must not be flushed twice.
        unsafe { libc::_exit(SETUP_FAILURE) }
    }
}
