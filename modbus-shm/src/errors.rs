use std::io;

use crate::store::{Bank, MAX_BANK_CELLS};

/// Fatal error kinds of the slave process.
///
/// Out-of-range register accesses are deliberately not represented here:
/// they are expected wire-level outcomes, surface as Modbus exception
/// responses and never abort a connection (see [`crate::store::AddressError`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shared memory creation or attachment failed.
    #[error("failed to create shared memory '{name}': {source}")]
    Resource {
        name: String,
        #[source]
        source: shared_memory::ShmemError,
    },

    /// A shared memory object already exists but is too small for the
    /// configured bank.
    #[error("shared memory '{name}' exists but holds {actual} bytes (need {required})")]
    SegmentSize {
        name: String,
        required: usize,
        actual: usize,
    },

    /// A bank was configured beyond the Modbus address space.
    #[error("invalid number of {bank} registers: {count} (maximum: {max})", max = MAX_BANK_CELLS)]
    BankSize { bank: Bank, count: usize },

    /// Bind, accept or socket transfer failed.
    #[error("network error: {0}")]
    Network(#[source] io::Error),

    /// The peer sent bytes that do not follow the Modbus TCP framing rules.
    /// The connection is torn down, no partial recovery is attempted.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Signal handler installation failed.
    #[error("failed to establish signal handler: {0}")]
    Signal(#[source] io::Error),
}
