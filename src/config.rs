//! Configuration for ptyexec
//!
//! Options come from, in order of precedence:
//! CLI > environment variables > config file > defaults.
//!
//! The config file is TOML, looked up at
//! `$XDG_CONFIG_HOME/ptyexec/config.toml` unless `--config` is given.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use serde::Deserialize;

use crate::error::Error;
use crate::pty::LineEnding;
use crate::relay::{RelaySettings, DEFAULT_BUFFER_SIZE, DEFAULT_EOF_RETRY_MS};

/// Largest accepted transfer buffer
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// CLI arguments for ptyexec
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "ptyexec")]
#[command(version)]
#[command(disable_version_flag = true)]
#[command(about = "Execute a command in a pseudo terminal, relaying pty I/O to standard I/O")]
#[command(after_help = "Exit status:
  0      --help or --version, or no command given
  127    system call failure
  128+N  the command was terminated by signal N
  other  the command's own exit status")]
pub struct CliArgs {
    /// Suppress echo on the current controlling terminal, if any
    #[arg(short = 'e', long)]
    pub no_echo: bool,

    /// Don't poll standard input until the command has produced output
    #[arg(short, long)]
    pub blind: bool,

    /// Use CR/NL as end of line on the pty (NL only by default)
    #[arg(short = '2', long)]
    pub crnl: bool,

    /// Suppress error messages
    #[arg(short, long)]
    pub quiet: bool,

    /// Path to a config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print version information and exit
    #[arg(short = 'v', long, action = ArgAction::Version)]
    pub version: Option<bool>,

    /// Command to execute, followed by its arguments
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<OsString>,
}

/// Resolved options for one run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Suppress diagnostics
    pub quiet: bool,
    /// Turn off echo on the parent's terminal while the command runs
    pub no_echo: bool,
    /// CR/NL line endings on the pty
    pub crnl: bool,
    /// Wait for child output before reading standard input
    pub blind: bool,
    /// Delay before re-polling standard input after an empty read
    pub eof_retry_ms: u16,
    /// Bytes moved per read
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            quiet: false,
            no_echo: false,
            crnl: false,
            blind: false,
            eof_retry_ms: DEFAULT_EOF_RETRY_MS,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
    pub field: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "config error in '{}': {}", field, self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

impl Config {
    /// Load configuration with full precedence
    pub fn load_with_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            // An explicit file has to be there
            Some(path) => Self::load_from_file(path)?,
            None => Self::default_config_path()
                .filter(|path| path.exists())
                .and_then(|path| match Self::load_from_file(&path) {
                    Ok(config) => Some(config),
                    Err(e) => {
                        log::warn!("Ignoring config file {:?}: {}", path, e);
                        None
                    }
                })
                .unwrap_or_default(),
        };

        config.apply_env_vars();
        config.apply_cli_args(args);
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            message: format!("failed to read {:?}: {}", path, e),
            field: None,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError {
            message: format!("failed to parse {:?}: {}", path, e),
            field: None,
        })
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ptyexec").join("config.toml"))
    }

    /// Apply environment variables to config
    fn apply_env_vars(&mut self) {
        self.apply_env(|key| env::var(key).ok());
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("PTYEXEC_EOF_RETRY_MS") {
            match val.parse() {
                Ok(ms) => self.eof_retry_ms = ms,
                Err(_) => log::warn!("Ignoring PTYEXEC_EOF_RETRY_MS={:?}", val),
            }
        }
        if let Some(val) = lookup("PTYEXEC_BUFFER_SIZE") {
            match val.parse() {
                Ok(size) => self.buffer_size = size,
                Err(_) => log::warn!("Ignoring PTYEXEC_BUFFER_SIZE={:?}", val),
            }
        }
        if let Some(val) = lookup("PTYEXEC_QUIET") {
            self.quiet = val == "1" || val.eq_ignore_ascii_case("true");
        }
    }

    /// Apply CLI arguments to config. Flags can only switch options on.
    fn apply_cli_args(&mut self, args: &CliArgs) {
        self.quiet |= args.quiet;
        self.no_echo |= args.no_echo;
        self.crnl |= args.crnl;
        self.blind |= args.blind;
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 || self.buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError {
                message: format!("must be between 1 and {}", MAX_BUFFER_SIZE),
                field: Some("buffer_size".to_string()),
            });
        }
        if self.eof_retry_ms == 0 {
            return Err(ConfigError {
                message: "must be at least 1".to_string(),
                field: Some("eof_retry_ms".to_string()),
            });
        }
        Ok(())
    }

    pub fn line_ending(&self) -> LineEnding {
        if self.crnl {
            LineEnding::CrLf
        } else {
            LineEnding::Unix
        }
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            blind: self.blind,
            eof_retry_ms: self.eof_retry_ms,
            buffer_size: self.buffer_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.eof_retry_ms, 100);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.line_ending(), LineEnding::Unix);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_flags() {
        let args = parse(&["ptyexec", "-e", "-2", "-b", "-q", "ls", "-la"]);
        assert!(args.no_echo && args.crnl && args.blind && args.quiet);
        assert_eq!(args.command, vec![OsString::from("ls"), OsString::from("-la")]);
    }

    #[test]
    fn test_cli_long_flags() {
        let args = parse(&["ptyexec", "--no-echo", "--crnl", "--blind", "--quiet", "cat"]);
        assert!(args.no_echo && args.crnl && args.blind && args.quiet);
        assert_eq!(args.command, vec![OsString::from("cat")]);
    }

    #[test]
    fn test_flags_after_command_belong_to_command() {
        let args = parse(&["ptyexec", "sh", "-c", "echo -e -q"]);
        assert!(!args.quiet && !args.no_echo);
        assert_eq!(args.command.len(), 3);
        assert_eq!(args.command[1], OsString::from("-c"));
    }

    #[test]
    fn test_no_command() {
        let args = parse(&["ptyexec", "-q"]);
        assert!(args.command.is_empty());
    }

    #[test]
    fn test_help_and_version_are_not_errors() {
        use clap::error::ErrorKind;
        for flag in ["-h", "--help"] {
            let err = CliArgs::try_parse_from(["ptyexec", flag]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
        for flag in ["-v", "--version"] {
            let err = CliArgs::try_parse_from(["ptyexec", flag]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DisplayVersion);
        }
    }

    #[test]
    fn test_config_toml_parsing() {
        let config: Config = toml::from_str(
            r#"
            crnl = true
            eof_retry_ms = 250
            buffer_size = 8192
            "#,
        )
        .unwrap();
        assert!(config.crnl);
        assert!(!config.quiet);
        assert_eq!(config.eof_retry_ms, 250);
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.line_ending(), LineEnding::CrLf);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PTYEXEC_EOF_RETRY_MS", "20"),
            ("PTYEXEC_BUFFER_SIZE", "not-a-number"),
            ("PTYEXEC_QUIET", "TRUE"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.eof_retry_ms, 20);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.quiet);
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "blind = false\neof_retry_ms = 30").unwrap();

        let path = file.path().to_str().unwrap();
        let args = parse(&["ptyexec", "--config", path, "-b", "true"]);
        let config = Config::load_with_args(&args).unwrap();
        assert!(config.blind);
        assert!(config.relay_settings().blind);
        assert_eq!(config.eof_retry_ms, 30);
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let args = parse(&["ptyexec", "--config", "/nonexistent/ptyexec.toml", "true"]);
        assert!(Config::load_with_args(&args).is_err());
    }

    #[test]
    fn test_config_error_is_a_setup_failure() {
        let args = parse(&["ptyexec", "--config", "/nonexistent/ptyexec.toml", "true"]);
        let err = Error::from(Config::load_with_args(&args).unwrap_err());
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.exit_code(), crate::error::SETUP_FAILURE);
        assert!(err.to_string().starts_with("config error"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.buffer_size = 0;
        assert!(config.validate().is_err());
        config.buffer_size = MAX_BUFFER_SIZE + 1;
        assert!(config.validate().is_err());
        config.buffer_size = 4096;

        config.eof_retry_ms = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.field.as_deref(), Some("eof_retry_ms"));
    }
}
