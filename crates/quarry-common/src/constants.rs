// Enums and constants shared across the agent processes.

use std::fmt;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Well-known directories used by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownDirectory {
    Bin,
    Diag,
    Root,
    Temp,
    Work,
}

impl fmt::Display for WellKnownDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Well-known configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownConfigFile {
    Agent,
    Credentials,
    RsaCredentials,
}

impl fmt::Display for WellKnownConfigFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Operating system platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsPlatform {
    Linux,
    MacOS,
    Windows,
}

impl fmt::Display for OsPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsPlatform::Linux => write!(f, "Linux"),
            OsPlatform::MacOS => write!(f, "OSX"),
            OsPlatform::Windows => write!(f, "Windows"),
        }
    }
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86,
    X64,
    Arm,
    Arm64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86 => write!(f, "X86"),
            Architecture::X64 => write!(f, "X64"),
            Architecture::Arm => write!(f, "ARM"),
            Architecture::Arm64 => write!(f, "ARM64"),
        }
    }
}

// ---------------------------------------------------------------------------
// Platform detection (compile-time)
// ---------------------------------------------------------------------------

/// The current OS platform, detected at compile time.
#[cfg(target_os = "linux")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Linux;
#[cfg(target_os = "macos")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::MacOS;
#[cfg(target_os = "windows")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Windows;

/// The current CPU architecture, detected at compile time.
#[cfg(target_arch = "x86")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::X86;
#[cfg(target_arch = "x86_64")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::X64;
#[cfg(target_arch = "arm")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::Arm;
#[cfg(target_arch = "aarch64")]
pub const CURRENT_ARCHITECTURE: Architecture = Architecture::Arm64;

// ---------------------------------------------------------------------------
// Constant groups
// ---------------------------------------------------------------------------

/// Relative directory names under the agent root.
pub mod path {
    pub const BIN_DIRECTORY: &str = "bin";
    pub const DIAG_DIRECTORY: &str = "_diag";
    pub const TEMP_DIRECTORY: &str = "_temp";
    pub const WORK_DIRECTORY: &str = "_work";
}

/// Process exit codes.
pub mod return_code {
    pub const SUCCESS: i32 = 0;
    pub const TERMINATED_ERROR: i32 = 1;
    pub const RETRYABLE_ERROR: i32 = 2;
}

/// Environment variable names read by the agent.
pub mod variables {
    pub mod agent {
        pub const ENHANCED_LOGGING: &str = "QUARRY_AGENT_ENHANCED_LOGGING";
        pub const PRINT_LOG_TO_STDOUT: &str = "QUARRY_AGENT_PRINT_LOG_TO_STDOUT";
        pub const TLS_NO_VERIFY: &str = "QUARRY_AGENT_TLS_NO_VERIFY";
        pub const HTTP_TIMEOUT: &str = "QUARRY_AGENT_HTTP_TIMEOUT";
    }
}

/// Well-known message types delivered through the message queue.
pub mod message_type {
    pub const JOB_REQUEST: &str = "JobRequest";
    pub const JOB_CANCELLATION: &str = "JobCancellation";
}
