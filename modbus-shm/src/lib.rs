//! Modbus TCP slave whose register banks are not private process memory
//! but named shared memory objects, so other processes can read and write
//! live register values while the protocol engine serves a master.

mod errors;
pub mod frame;
pub mod shutdown;
pub mod slave;
pub mod store;

pub use errors::Error;
pub use frame::{ExceptionCode, FunctionCode};
pub use shutdown::{Shutdown, DEFAULT_GRACE_PERIOD};
pub use slave::{Connection, RequestOutcome, Slave, SlaveConfig};
pub use store::{AddressError, Bank, RegisterStore, StoreConfig, MAX_BANK_CELLS};
