//! Exit codes following sysexits.h conventions.

use snapcrawl_core::CrawlError;

/// Successful execution.
pub const SUCCESS: i32 = 0;

/// General error (catch-all).
pub const GENERAL_ERROR: i32 = 1;

/// Command line usage or configuration error.
/// Maps to EX_USAGE from sysexits.h.
pub const USAGE_ERROR: i32 = 64;

/// Cannot open input (config file, database, storage folder).
/// Maps to EX_NOINPUT from sysexits.h.
pub const INPUT_ERROR: i32 = 66;

/// Network unavailable.
/// Maps to EX_UNAVAILABLE from sysexits.h.
pub const NETWORK_ERROR: i32 = 69;

/// I/O error (cannot write files, database failure).
/// Maps to EX_IOERR from sysexits.h.
pub const IO_ERROR: i32 = 74;

/// Represents an exit code with optional error context.
pub struct ExitCode {
    pub code: i32,
    pub message: Option<String>,
}

impl ExitCode {
    pub const fn success() -> Self {
        Self {
            code: SUCCESS,
            message: None,
        }
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");

        let code = if message.contains("Failed to read") || message.contains("not found") {
            INPUT_ERROR
        } else if let Some(core) = err.chain().find_map(|e| e.downcast_ref::<CrawlError>()) {
            match core {
                CrawlError::Config(_) | CrawlError::Yaml(_) => USAGE_ERROR,
                CrawlError::Http(_) => NETWORK_ERROR,
                CrawlError::Io(_) | CrawlError::Database(_) | CrawlError::Persistence(_) => {
                    IO_ERROR
                }
                _ => GENERAL_ERROR,
            }
        } else if message.contains("Failed to write") {
            IO_ERROR
        } else {
            GENERAL_ERROR
        };

        Self {
            code,
            message: Some(message),
        }
    }
}
