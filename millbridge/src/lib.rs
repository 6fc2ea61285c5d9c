//! # millbridge
//!
//! A library for talking to CNC mills over TCP.
//!
//! This crate provides the core protocol plumbing for mill
//! communication:
//!
//! - A byte-exact XMODEM engine (128-byte and 8K block variants) with
//!   CRC16-XMODEM checking and an MD5 short-circuit block
//! - A command catalog and router for the mill's line protocol
//! - An in-memory virtual file store standing in for the mill's SD card
//! - A mock controller: a TCP server interchangeable with a real
//!   machine for integration testing
//! - Parsers for the controller's status, diagnose and modal reports
//!
//! ## Cancellation Model
//!
//! XMODEM transfers block the socket for their whole duration. They can
//! be interrupted cooperatively through a [`CancelFlag`]: the embedding
//! application (e.g. the CLI on Ctrl-C) sets the flag, and the engine
//! checks it at every block boundary, shutting the transfer down with a
//! clean CAN sequence instead of an abrupt close.
//!
//! ```ignore
//! use millbridge::CancelFlag;
//!
//! // Option 1: bridge from the global interrupt flag (set on Ctrl-C)
//! let cancel = millbridge::cancel_flag_from_global();
//!
//! // Option 2: a standalone flag shared with the transfer
//! let cancel = CancelFlag::default();
//! cancel.cancel();
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use millbridge::{CommandCatalog, MockServer, VirtualFileStore};
//!
//! fn main() -> millbridge::Result<()> {
//!     let server = MockServer::new(CommandCatalog::builtin(), VirtualFileStore::builtin());
//!     let listener = MockServer::bind("localhost", 2222)?;
//!     server.serve(&listener)
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod catalog;
pub mod cnc;
pub mod error;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod vfs;

/// Global interrupt flag for CLI-to-library communication.
///
/// Set by the CLI when Ctrl-C is received, checked by
/// `cancel_flag_from_global()` during transfers.
static INTERRUPT_FLAG: AtomicBool = AtomicBool::new(false);

/// Cooperative cancellation flag for long-running transfers.
///
/// Cheap to clone; all clones share one underlying flag. The engine
/// checks it at block boundaries and clears it after honoring it. A
/// flag created with [`cancel_flag_from_global`] additionally follows
/// the process-wide interrupt flag set on Ctrl-C.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    local: Arc<AtomicBool>,
    follows_global: bool,
}

impl CancelFlag {
    /// Create a fresh, unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.local.store(true, Ordering::SeqCst);
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.local.load(Ordering::SeqCst)
            || (self.follows_global && INTERRUPT_FLAG.load(Ordering::SeqCst))
    }

    /// Reset the flag after the cancellation has been honored.
    pub fn clear(&self) {
        self.local.store(false, Ordering::SeqCst);
        if self.follows_global {
            INTERRUPT_FLAG.store(false, Ordering::SeqCst);
        }
    }
}

/// A [`CancelFlag`] that follows the global interrupt flag.
///
/// Transfers given this flag stop cleanly when Ctrl-C is pressed.
#[must_use]
pub fn cancel_flag_from_global() -> CancelFlag {
    CancelFlag {
        local: Arc::new(AtomicBool::new(false)),
        follows_global: true,
    }
}

/// Set the global interrupt flag (for the CLI's Ctrl-C handler).
pub fn set_interrupt_flag() {
    INTERRUPT_FLAG.store(true, Ordering::SeqCst);
}

/// Clear the global interrupt flag.
pub fn clear_interrupt_flag() {
    INTERRUPT_FLAG.store(false, Ordering::SeqCst);
}

/// Returns whether interruption was requested.
#[must_use]
pub fn is_interrupt_requested() -> bool {
    INTERRUPT_FLAG.load(Ordering::SeqCst)
}

// Re-exports for convenience
pub use {
    catalog::{CommandCatalog, CommandCategory, CommandSpec},
    cnc::{CncState, MachineState, Position},
    error::{Error, Result},
    protocol::{
        BlockMode, NoProgress, Progress, TransferOutcome, Xmodem, XmodemConfig, md5_hex,
    },
    server::{ControllerState, DEFAULT_HOST, DEFAULT_PORT, MockServer},
    stream::{ByteStream, TcpByteStream},
    vfs::{DirEntry, VirtualFile, VirtualFileStore, normalize_path},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_shared_across_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_canceled());

        clone.cancel();
        assert!(flag.is_canceled());

        flag.clear();
        assert!(!clone.is_canceled());
    }

    #[test]
    fn test_interrupt_flag_toggle() {
        set_interrupt_flag();
        assert!(is_interrupt_requested());
        assert!(cancel_flag_from_global().is_canceled());

        clear_interrupt_flag();
        assert!(!is_interrupt_requested());
        assert!(!cancel_flag_from_global().is_canceled());
    }
}
