// Console output surface with tracing integration.
// The listener uses this for the small set of user-visible lines (connection
// diagnostics, reconnect notices, the listening banner); everything else
// goes through `Tracing`.

use crate::host_context::HostContext;
use crate::tracing::Tracing;

use quarry_sdk::TraceWriter;
use std::io::{self, Write};
use std::sync::Arc;

/// Console color codes for terminal output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleColor {
    Red,
    Green,
    Yellow,
    Cyan,
    Default,
}

impl ConsoleColor {
    /// ANSI escape code for the color.
    fn ansi_code(&self) -> &'static str {
        match self {
            ConsoleColor::Red => "\x1b[31m",
            ConsoleColor::Green => "\x1b[32m",
            ConsoleColor::Yellow => "\x1b[33m",
            ConsoleColor::Cyan => "\x1b[36m",
            ConsoleColor::Default => "",
        }
    }

    /// ANSI reset code.
    fn reset() -> &'static str {
        "\x1b[0m"
    }
}

/// Terminal abstraction for user-facing console output.
#[derive(Default)]
pub struct Terminal {
    /// Whether to suppress output.
    pub silent: bool,
    /// Trace instance for logging terminal activity.
    trace: Option<Tracing>,
}

impl Terminal {
    /// Create a new `Terminal`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize with a host context (sets up tracing).
    pub fn initialize(&mut self, context: &Arc<HostContext>) {
        self.trace = Some(context.get_trace("Terminal"));
    }

    /// Write a string to stdout (no newline).
    pub fn write(&self, message: &str, color: Option<ConsoleColor>) {
        if let Some(ref trace) = self.trace {
            trace.info(&format!("WRITE: {}", message));
        }

        if !self.silent {
            if let Some(color) = color {
                print!("{}{}{}", color.ansi_code(), message, ConsoleColor::reset());
            } else {
                print!("{}", message);
            }
            let _ = io::stdout().flush();
        }
    }

    /// Write a line to stdout.
    pub fn write_line(&self, line: &str, color: Option<ConsoleColor>) {
        if let Some(ref trace) = self.trace {
            trace.info(&format!("WRITE LINE: {}", line));
        }

        if !self.silent {
            if let Some(color) = color {
                println!("{}{}{}", color.ansi_code(), line, ConsoleColor::reset());
            } else {
                println!("{}", line);
            }
        }
    }

    /// Write an empty line.
    pub fn write_empty_line(&self) {
        self.write_line("", None);
    }

    /// Write an error message to stderr.
    pub fn write_error(&self, line: &str) {
        if let Some(ref trace) = self.trace {
            trace.error(&format!("WRITE ERROR: {}", line));
        }

        if !self.silent {
            eprintln!(
                "{}{}{}",
                ConsoleColor::Red.ansi_code(),
                line,
                ConsoleColor::reset()
            );
        }
    }

    /// Write an error from an `anyhow::Error`.
    pub fn write_error_err(&self, err: &anyhow::Error) {
        if let Some(ref trace) = self.trace {
            trace.error("WRITE ERROR (exception):");
            trace.error(&format!("{:#}", err));
        }

        if !self.silent {
            eprintln!(
                "{}{}{}",
                ConsoleColor::Red.ansi_code(),
                err,
                ConsoleColor::reset()
            );
        }
    }

    /// Write a section header.
    pub fn write_section(&self, message: &str) {
        if !self.silent {
            println!();
            println!("# {}", message);
            println!();
        }
    }

    /// Write a success message with a checkmark prefix.
    pub fn write_success_message(&self, message: &str) {
        if let Some(ref trace) = self.trace {
            trace.info(&format!("WRITE SUCCESS: {}", message));
        }

        if !self.silent {
            print!(
                "{}√ {}",
                ConsoleColor::Green.ansi_code(),
                ConsoleColor::reset()
            );
            println!("{}", message);
        }
    }
}
