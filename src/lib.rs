//! ptyexec - run a command on a pseudo-terminal with redirected stdio
//!
//! The child believes it is talking to an interactive terminal while its
//! input and output are relayed to and from the parent's own standard
//! streams, which may be files, pipes or here-documents.
//!
//! - `pty`: pty allocation, line discipline and child launching
//! - `terminal`: echo suppression on the parent's terminal
//! - `relay`: the poll-driven duplex relay
//! - `signals`: forwarding of termination signals
//! - `session`: the run lifecycle tying it all together
//! - `config`: CLI, config file and environment options

pub mod config;
pub mod error;
pub mod pty;
pub mod relay;
pub mod session;
pub mod signals;
pub mod terminal;

pub use config::{CliArgs, Config};
pub use error::{Error, ExitOutcome, Result};
pub use session::Session;
