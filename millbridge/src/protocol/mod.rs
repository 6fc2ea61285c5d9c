//! Protocol implementations.

pub mod crc;
pub mod xmodem;

// Re-export common types
pub use xmodem::{
    BlockMode, NoProgress, Progress, TransferOutcome, Xmodem, XmodemConfig, md5_hex,
};
