//! CLI exit code registry — the single source of truth. Exit codes are
//! part of the shell contract; scripts rely on them.
//!
//! | Range | Domain  | Description                         |
//! |-------|---------|-------------------------------------|
//! | 0     | —       | Success                             |
//! | 1     | —       | General error                       |
//! | 2     | —       | Usage error (bad args)              |
//! | 3-9   | run     | Batch run outcomes                  |
//! | 10-19 | store   | Database access                     |
//! | 20-29 | import  | Source file ingest                  |
//! | 30-39 | config  | Engine configuration                |

pub const EXIT_SUCCESS: u8 = 0;

/// General error. Prefer a specific code.
pub const EXIT_ERROR: u8 = 1;

pub const EXIT_USAGE: u8 = 2;

/// The run finished in `failed` state (timeout or cancellation).
pub const EXIT_RUN_FAILED: u8 = 3;

/// The run could not start (bad scope, setup failure).
pub const EXIT_RUN_SETUP: u8 = 4;

/// Database could not be opened or a query failed.
pub const EXIT_STORE: u8 = 10;

/// The requested row (run, correlation, event, trip) does not exist.
pub const EXIT_NOT_FOUND: u8 = 11;

/// CSV file could not be read or parsed.
pub const EXIT_IMPORT_PARSE: u8 = 20;

/// Engine config file is invalid.
pub const EXIT_CONFIG_INVALID: u8 = 30;

use fleetlink_store::StoreError;

pub fn store_exit_code(err: &StoreError) -> u8 {
    match err {
        StoreError::NotFound(_) => EXIT_NOT_FOUND,
        _ => EXIT_STORE,
    }
}
