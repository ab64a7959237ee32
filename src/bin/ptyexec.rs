//! ptyexec
//!
//! Executes a command in a pseudo terminal, relaying pty I/O to standard I/O.

use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use log::LevelFilter;

use ptyexec::error::SETUP_FAILURE;
use ptyexec::{CliArgs, Config, Error, Session};

fn main() -> ExitCode {
    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => exit_code(SETUP_FAILURE),
            };
        }
    };

    // Warn by default; RUST_LOG=debug shows the relay at work
    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if args.quiet {
        logger.filter_level(LevelFilter::Off);
    }
    logger.init();

    if args.command.is_empty() {
        let _ = CliArgs::command().print_help();
        return ExitCode::SUCCESS;
    }

    let config = match Config::load_with_args(&args) {
        Ok(config) => config,
        Err(e) => return fail(Error::from(e), args.quiet),
    };
    if config.quiet {
        log::set_max_level(LevelFilter::Off);
    }

    let session = Session::leak(config);
    match session.run(&args.command) {
        Ok(outcome) => {
            log::debug!("Command finished: {:?}", outcome);
            exit_code(outcome.status())
        }
        Err(e) => fail(e, session.config().quiet),
    }
}

/// Report a fatal error once on stderr and turn it into the exit status
fn fail(e: Error, quiet: bool) -> ExitCode {
    log::debug!("Fatal error: {:?}", e);
    if !quiet {
        eprintln!("ptyexec: {}", e);
    }
    exit_code(e.exit_code())
}

fn exit_code(status: i32) -> ExitCode {
    ExitCode::from(status.clamp(0, 255) as u8)
}
