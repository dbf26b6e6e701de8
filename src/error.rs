//! Error types for dissect.
//!
//! Two rules shape this module:
//!
//! - Configuration mistakes (duplicate names, unresolvable modules, cyclic
//!   decode chains) are fatal at registration or setup time and surface as
//!   [`RegistrationError`].
//! - Packet-level problems (short headers, unknown next protocols, bad
//!   state transitions) are NOT errors. A module stops the decode walk by
//!   returning `None` and the kernel moves on to the next packet; nothing
//!   in the decode path unwinds.

use thiserror::Error;

/// Main error type for dissect operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Module or handler registration failed
    #[error("registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// Error reading or parsing a capture file
    #[error("pcap error: {0}")]
    Pcap(#[from] PcapError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors detected while assembling the module chain.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistrationError {
    /// A module with this name is already registered
    #[error("duplicate module name: {name}")]
    DuplicateModule { name: String },

    /// An event with this name is already defined by another module
    #[error("duplicate event name: {name}")]
    DuplicateEvent { name: String },

    /// A module defined the same parameter twice
    #[error("duplicate parameter name: {name}")]
    DuplicateParam { name: String },

    /// `setup()` asked for a module that was never registered
    #[error("unknown module: {name}")]
    UnknownModule { name: String },

    /// The declared decode chain loops back on itself
    #[error("decode chain cycle through module: {name}")]
    DecodeCycle { name: String },

    /// Setup ran with no modules registered
    #[error("no modules registered")]
    EmptyChain,
}

/// Errors related to pcap file reading.
#[derive(Error, Debug)]
pub enum PcapError {
    /// File not found
    #[error("file not found: {path}")]
    FileNotFound { path: String },

    /// Invalid pcap format
    #[error("invalid pcap format: {reason}")]
    InvalidFormat { reason: String },

    /// The file ended in the middle of a record
    #[error("truncated capture file at frame {frame}")]
    Truncated { frame: u64 },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
