//! Pseudo-terminal provisioning
//!
//! Allocates the master/slave pair the child runs on and computes the
//! slave's line discipline.
//!
//! # References
//!
//! - posix_openpt(3): https://man7.org/linux/man-pages/man3/posix_openpt.3.html
//! - grantpt(3), unlockpt(3), ptsname(3)
//! - termios(3): https://man7.org/linux/man-pages/man3/termios.3.html

pub mod child;

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::pty::{grantpt, posix_openpt, ptsname, unlockpt, PtyMaster};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, InputFlags, LocalFlags, OutputFlags, SetArg, Termios};

use crate::error::{Error, Result};

pub use child::{Child, Command};

/// End-of-line convention seen by the child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    /// A single NL terminates a line in both directions
    #[default]
    Unix,
    /// CR/NL on output, CR read as NL on input
    CrLf,
}

/// Line-discipline settings applied to the slave side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineDiscipline {
    pub line_ending: LineEnding,
}

impl LineDiscipline {
    pub fn new(line_ending: LineEnding) -> Self {
        Self { line_ending }
    }

    /// Rewrite `termios` in place.
    ///
    /// Local echo is always turned off: the parent's terminal already
    /// shows what the user types.
    pub fn apply(&self, termios: &mut Termios) {
        termios.local_flags.remove(LocalFlags::ECHO);

        match self.line_ending {
            LineEnding::Unix => {
                termios.output_flags.remove(OutputFlags::ONLCR);
                termios.input_flags.remove(InputFlags::ICRNL);
            }
            LineEnding::CrLf => {
                termios.input_flags.insert(InputFlags::ICRNL);
                termios
                    .input_flags
                    .remove(InputFlags::INLCR | InputFlags::IGNCR);
                termios
                    .output_flags
                    .insert(OutputFlags::OPOST | OutputFlags::ONLCR);
                termios
                    .output_flags
                    .remove(OutputFlags::OCRNL | OutputFlags::ONLRET);
            }
        }
    }

    /// Read the current settings of `fd`, apply ours and write them back
    pub fn configure(&self, fd: BorrowedFd<'_>) -> Result<()> {
        self.configure_raw(fd)
            .map_err(|(op, source)| Error::Termios { op, source })
    }

    /// Like [`configure`](Self::configure), but failures carry only the
    /// failing call and errno, so the forked child can report them
    /// without allocating.
    pub(crate) fn configure_raw(
        &self,
        fd: BorrowedFd<'_>,
    ) -> std::result::Result<(), (&'static str, Errno)> {
        let mut attrs = termios::tcgetattr(fd).map_err(|e| ("tcgetattr", e))?;
        self.apply(&mut attrs);
        termios::tcsetattr(fd, SetArg::TCSANOW, &attrs).map_err(|e| ("tcsetattr", e))
    }
}

/// A pseudo-terminal master together with its (already configured) slave
///
/// The slave handle is held only until the child has been forked; the
/// parent then releases it so that the master reports hangup once the
/// child side is gone. The master lives until the child is reaped.
pub struct PtyPair {
    master: PtyMaster,
    slave: Option<OwnedFd>,
    slave_path: String,
    discipline: LineDiscipline,
}

impl PtyPair {
    /// Allocate a new pair and configure the slave's line discipline
    pub fn open(discipline: LineDiscipline) -> Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(Error::OpenMaster)?;
        grantpt(&master).map_err(Error::Grant)?;
        unlockpt(&master).map_err(Error::Unlock)?;

        // SAFETY: ptsname uses a static buffer; nothing else calls it
        // concurrently and the result is copied out immediately.
        let slave_path = unsafe { ptsname(&master) }.map_err(Error::SlaveName)?;
        set_cloexec(master.as_raw_fd())?;

        let raw = open(
            slave_path.as_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY,
            Mode::empty(),
        )
        .map_err(|source| Error::OpenSlave {
            path: slave_path.clone(),
            source,
        })?;
        // SAFETY: `open` just returned this descriptor and nothing else owns it
        let slave = unsafe { OwnedFd::from_raw_fd(raw) };
        set_cloexec(raw)?;

        discipline.configure(slave.as_fd())?;

        log::debug!("Allocated pty {}", slave_path);

        Ok(Self {
            master,
            slave: Some(slave),
            slave_path,
            discipline,
        })
    }

    /// Path of the slave device, e.g. `/dev/pts/3`
    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }

    /// Slave path as a C string, for use after fork
    pub(crate) fn slave_path_cstr(&self) -> Result<CString> {
        CString::new(self.slave_path.as_str())
            .map_err(|e| Error::InvalidArgument(format!("slave path: {}", e)))
    }

    pub fn discipline(&self) -> LineDiscipline {
        self.discipline
    }

    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    pub fn master_raw(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Raw descriptor of the slave, if the parent still holds it
    pub fn slave_raw(&self) -> Option<RawFd> {
        self.slave.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Hand the slave handle over to the caller
    pub fn take_slave(&mut self) -> Option<OwnedFd> {
        self.slave.take()
    }

    /// Close the parent's copy of the slave
    pub fn release_slave(&mut self) {
        self.slave = None;
    }
}

impl AsFd for PtyPair {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

/// Keep pty handles out of processes exec'd by anyone but our child
fn set_cloexec(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(Error::Fcntl)?;
    Ok(())
}
