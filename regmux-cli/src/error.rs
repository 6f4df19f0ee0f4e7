//! CLI error handling with user-friendly messages.

use std::fmt;
use std::process;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Bad command-line argument
    Argument(String),
    /// Failed to read or parse a program script
    Script { path: String, reason: String },
    /// Runtime operation failed
    Runtime(regmux::error::Error),
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);
        let code = match self {
            CliError::LoggingInit(_) => 3,
            CliError::Argument(_) => 2,
            CliError::Script { .. } => 2,
            CliError::Runtime(_) => 1,
        };
        process::exit(code);
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "failed to initialize logging: {msg}"),
            CliError::Argument(msg) => write!(f, "{msg}"),
            CliError::Script { path, reason } => {
                write!(f, "failed to load program script {path}: {reason}")
            }
            CliError::Runtime(e) => write!(f, "runtime error: {e} (code {})", e.code()),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Runtime(e) => Some(e),
            _ => None,
        }
    }
}

impl From<regmux::error::Error> for CliError {
    fn from(e: regmux::error::Error) -> Self {
        CliError::Runtime(e)
    }
}
