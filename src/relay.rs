//! Duplex relay between the pty master and the parent's stdio
//!
//! A single-threaded, poll-driven loop moves bytes master → output and
//! input → master. Each direction is drained completely once it reports
//! readiness, writing with a wait-for-writable retry loop so partial
//! writes are never lost.
//!
//! The loop ends only when the master reports hangup, i.e. every handle
//! to the slave has been closed.
//!
//! The input side needs care: a readable notification followed by a
//! zero-length read does not necessarily mean the source is finished
//! (regular files, here-documents and some pipe implementations behave
//! this way). Such a source is left out of the next wait and re-armed
//! after a short delay. Only a hangup notification removes the input for
//! good.

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{read, write};

use crate::error::{Error, Result};

/// Default delay before re-polling input that returned an empty read
pub const DEFAULT_EOF_RETRY_MS: u16 = 100;

/// Default size of the transfer buffer
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Readiness bits that mean an endpoint has gone away
const GONE: PollFlags = PollFlags::POLLHUP
    .union(PollFlags::POLLERR)
    .union(PollFlags::POLLNVAL);

/// The three descriptors the relay moves data between
#[derive(Debug, Clone, Copy)]
pub struct Endpoints<'fd> {
    /// The pty master, read for child output and written with input
    pub master: BorrowedFd<'fd>,
    /// Where input for the child comes from, normally stdin
    pub input: BorrowedFd<'fd>,
    /// Where child output goes, normally stdout
    pub output: BorrowedFd<'fd>,
}

/// Tunables for [`Relay`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    /// Wait for the first master event before polling input
    pub blind: bool,
    /// Delay before re-polling input after an empty read
    pub eof_retry_ms: u16,
    /// Bytes moved per read
    pub buffer_size: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            blind: false,
            eof_retry_ms: DEFAULT_EOF_RETRY_MS,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Which endpoints the next wait covers and for how long
///
/// Once input has hung up it is never polled again. After an empty read
/// it sits out exactly one round, bounded by the retry delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayState {
    input_open: bool,
    poll_input: bool,
    next_timeout: Option<u16>,
}

impl RelayState {
    /// Initial state; in blind mode the first round waits on the master only
    pub fn new(blind: bool) -> Self {
        Self {
            input_open: true,
            poll_input: !blind,
            next_timeout: None,
        }
    }

    /// Whether the next wait includes the input
    pub fn polls_input(&self) -> bool {
        self.poll_input
    }

    /// Whether input can ever be polled again
    pub fn input_open(&self) -> bool {
        self.input_open
    }

    /// Timeout for the next wait, `None` meaning wait forever
    pub fn next_timeout(&self) -> Option<u16> {
        self.next_timeout
    }

    /// Reset per-round restrictions after a wait returned
    fn begin_round(&mut self) {
        self.poll_input = self.input_open;
        self.next_timeout = None;
    }

    /// Skip input in the next round and come back after `delay_ms`
    fn defer_input(&mut self, delay_ms: u16) {
        if self.input_open {
            self.poll_input = false;
            self.next_timeout = Some(delay_ms);
        }
    }

    /// Stop polling input for good
    fn close_input(&mut self) {
        self.input_open = false;
        self.poll_input = false;
        self.next_timeout = None;
    }

    fn poll_timeout(&self) -> PollTimeout {
        match self.next_timeout {
            Some(ms) => PollTimeout::from(ms),
            None => PollTimeout::NONE,
        }
    }
}

/// Result of draining one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    /// Everything that was ready has been forwarded
    Drained,
    /// A read returned zero bytes
    Empty,
    /// The master side is gone (EIO)
    Hangup,
}

/// The relay loop
pub struct Relay<'fd> {
    endpoints: Endpoints<'fd>,
    state: RelayState,
    eof_retry_ms: u16,
    buf: Vec<u8>,
}

impl<'fd> Relay<'fd> {
    pub fn new(endpoints: Endpoints<'fd>, settings: RelaySettings) -> Self {
        Self {
            endpoints,
            state: RelayState::new(settings.blind),
            eof_retry_ms: settings.eof_retry_ms,
            buf: vec![0u8; settings.buffer_size.max(1)],
        }
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// Relay until the master hangs up
    pub fn run(&mut self) -> Result<()> {
        loop {
            let (master_events, input_events) = match self.wait()? {
                Some(events) => events,
                None => continue,
            };
            self.state.begin_round();

            let mut hangup = master_events.intersects(GONE);
            if master_events.contains(PollFlags::POLLIN) {
                hangup |= self.forward_output()? != Transfer::Drained;
            }
            if hangup {
                log::debug!("Master hung up, relay finished");
                return Ok(());
            }

            let Some(input_events) = input_events else {
                continue;
            };
            if input_events.contains(PollFlags::POLLIN) {
                match self.forward_input()? {
                    Transfer::Drained => {}
                    Transfer::Empty => {
                        log::debug!("Empty read on input, re-polling in {}ms", self.eof_retry_ms);
                        self.state.defer_input(self.eof_retry_ms);
                    }
                    // The next wait reports the hangup on the master
                    Transfer::Hangup => continue,
                }
            }
            if input_events.intersects(GONE) {
                log::debug!("Input closed, no longer polling it");
                self.state.close_input();
            }
        }
    }

    /// One wait over the active endpoints. `None` if interrupted.
    fn wait(&self) -> Result<Option<(PollFlags, Option<PollFlags>)>> {
        let mut fds = [
            PollFd::new(self.endpoints.master, PollFlags::POLLIN),
            PollFd::new(self.endpoints.input, PollFlags::POLLIN),
        ];
        let active = if self.state.polls_input() { 2 } else { 1 };

        match poll(&mut fds[..active], self.state.poll_timeout()) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(None),
            Err(e) => return Err(Error::Poll(e)),
        }

        let master = fds[0].revents().unwrap_or(PollFlags::empty());
        let input = (active == 2).then(|| fds[1].revents().unwrap_or(PollFlags::empty()));
        Ok(Some((master, input)))
    }

    /// Master → output. A zero read or EIO means the slave side is gone.
    fn forward_output(&mut self) -> Result<Transfer> {
        let Endpoints { master, output, .. } = self.endpoints;
        loop {
            let n = match read_retrying(master, &mut self.buf) {
                Ok(0) | Err(Errno::EIO) => return Ok(Transfer::Hangup),
                Ok(n) => n,
                Err(e) => return Err(Error::Read(e)),
            };
            write_fully(output, &self.buf[..n]).map_err(Error::Write)?;
            if !has_data(master)? {
                return Ok(Transfer::Drained);
            }
        }
    }

    /// Input → master
    fn forward_input(&mut self) -> Result<Transfer> {
        let Endpoints { master, input, .. } = self.endpoints;
        loop {
            let n = match read_retrying(input, &mut self.buf) {
                Ok(0) => return Ok(Transfer::Empty),
                Ok(n) => n,
                Err(e) => return Err(Error::Read(e)),
            };
            match write_fully(master, &self.buf[..n]) {
                Ok(()) => {}
                Err(Errno::EIO) => return Ok(Transfer::Hangup),
                Err(e) => return Err(Error::Write(e)),
            }
            if !has_data(input)? {
                return Ok(Transfer::Drained);
            }
        }
    }
}

fn read_retrying(fd: BorrowedFd<'_>, buf: &mut [u8]) -> nix::Result<usize> {
    loop {
        match read(fd.as_raw_fd(), buf) {
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            other => return other,
        }
    }
}

/// Non-blocking check for pending input
fn has_data(fd: BorrowedFd<'_>) -> Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    loop {
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::Poll(e)),
        }
    }
    Ok(fds[0]
        .revents()
        .is_some_and(|r| r.contains(PollFlags::POLLIN)))
}

/// Write all of `data`, waiting for `fd` to become writable before each
/// attempt and continuing after partial writes.
fn write_fully(fd: BorrowedFd<'_>, mut data: &[u8]) -> nix::Result<()> {
    while !data.is_empty() {
        let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }

        // An error or hangup without POLLOUT still goes through write()
        // so the caller sees the actual errno instead of spinning.
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if !revents.intersects(PollFlags::POLLOUT | GONE) {
            continue;
        }

        match write(fd, data) {
            Ok(n) => data = &data[n..],
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
