//! Register store backed by named shared memory objects.
//!
//! One object per register bank, named `<prefix>DO`, `<prefix>DI`,
//! `<prefix>AO` and `<prefix>AI`. The objects are created (or attached,
//! if another process created them first) on construction and stay
//! attachable by any other process for the lifetime of this one. Every
//! access goes through bounds-checked accessors; there is no cross-process
//! lock, so multi-cell operations may interleave with external writers at
//! cell granularity.

use std::fmt;
use std::ptr;

use log::debug;
use serde::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::errors::Error;

/// Upper bound for a bank: the Modbus address space is 16 bit.
pub const MAX_BANK_CELLS: usize = 0x10000;

pub const DEFAULT_NAME_PREFIX: &str = "modbus_";

/// The four register banks of a Modbus slave.
///
/// "Input" banks are read-only for the master, which is a wire protocol
/// policy, not a storage permission: processes attached to the segment
/// write them freely (that is how sensor values get in).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    /// Discrete output coils (1 bit, master read-write).
    DiscreteOutput,
    /// Discrete input coils (1 bit, master read-only).
    DiscreteInput,
    /// Analog output / holding registers (16 bit, master read-write).
    AnalogOutput,
    /// Analog input registers (16 bit, master read-only).
    AnalogInput,
}

impl Bank {
    pub const ALL: [Bank; 4] = [
        Bank::DiscreteOutput,
        Bank::DiscreteInput,
        Bank::AnalogOutput,
        Bank::AnalogInput,
    ];

    /// Suffix appended to the name prefix of the backing shared memory object.
    pub fn suffix(self) -> &'static str {
        match self {
            Bank::DiscreteOutput => "DO",
            Bank::DiscreteInput => "DI",
            Bank::AnalogOutput => "AO",
            Bank::AnalogInput => "AI",
        }
    }

    /// Storage width of one cell. Coils take one byte each (libmodbus
    /// layout), registers a native-endian u16.
    pub fn cell_bytes(self) -> usize {
        match self {
            Bank::DiscreteOutput | Bank::DiscreteInput => 1,
            Bank::AnalogOutput | Bank::AnalogInput => 2,
        }
    }

    /// Whether write function codes may target this bank.
    pub fn master_writable(self) -> bool {
        matches!(self, Bank::DiscreteOutput | Bank::AnalogOutput)
    }

    fn idx(self) -> usize {
        match self {
            Bank::DiscreteOutput => 0,
            Bank::DiscreteInput => 1,
            Bank::AnalogOutput => 2,
            Bank::AnalogInput => 3,
        }
    }
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Bank sizes and the shared memory name prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub do_size: usize,
    pub di_size: usize,
    pub ao_size: usize,
    pub ai_size: usize,
    pub name_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> StoreConfig {
        StoreConfig {
            do_size: MAX_BANK_CELLS,
            di_size: MAX_BANK_CELLS,
            ao_size: MAX_BANK_CELLS,
            ai_size: MAX_BANK_CELLS,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }
}

impl StoreConfig {
    pub fn bank_size(&self, bank: Bank) -> usize {
        match bank {
            Bank::DiscreteOutput => self.do_size,
            Bank::DiscreteInput => self.di_size,
            Bank::AnalogOutput => self.ao_size,
            Bank::AnalogInput => self.ai_size,
        }
    }
}

/// Rejected register access: `address + count` leaves the configured bank.
///
/// This is not a process error. The protocol engine answers it with an
/// illegal-data-address exception response and keeps the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressError {
    pub bank: Bank,
    pub address: u16,
    pub count: usize,
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "address {} count {} exceeds {} bank bounds",
            self.address, self.count, self.bank
        )
    }
}

impl std::error::Error for AddressError {}

struct Segment {
    shmem: Shmem,
    cells: usize,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("cells", &self.cells)
            .finish_non_exhaustive()
    }
}

// The mapping stays valid for the lifetime of `shmem`, and within this
// process the store is driven from one thread at a time. Concurrent
// mutation by other processes attached to the same object is the design
// point of the store, not a safety hazard for this mapping.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn open(name: &str, cells: usize, cell_bytes: usize) -> Result<Segment, Error> {
        // shm objects cannot be empty; a zero-cell bank still maps one
        // byte and rejects every access through the bounds check.
        let required = (cells * cell_bytes).max(1);
        let shmem = match ShmemConf::new().os_id(name).size(required).create() {
            Ok(m) => m,
            Err(ShmemError::MappingIdExists) => {
                let existing = ShmemConf::new().os_id(name).open().map_err(|source| {
                    Error::Resource {
                        name: name.to_string(),
                        source,
                    }
                })?;
                if existing.len() < required {
                    return Err(Error::SegmentSize {
                        name: name.to_string(),
                        required,
                        actual: existing.len(),
                    });
                }
                debug!("attached to existing shared memory '{}'", name);
                existing
            }
            Err(source) => {
                return Err(Error::Resource {
                    name: name.to_string(),
                    source,
                })
            }
        };
        Ok(Segment { shmem, cells })
    }

    fn check(&self, bank: Bank, address: u16, count: usize) -> Result<(), AddressError> {
        if address as usize + count > self.cells {
            return Err(AddressError {
                bank,
                address,
                count,
            });
        }
        Ok(())
    }
}

/// The four register banks, each backed by its own shared memory object.
///
/// Owned objects are unlinked when the store drops; objects attached from
/// another creator are left alone.
#[derive(Debug)]
pub struct RegisterStore {
    segments: [Segment; 4],
    prefix: String,
}

impl RegisterStore {
    /// Create (or attach to) the four shared memory segments.
    pub fn create(cfg: &StoreConfig) -> Result<RegisterStore, Error> {
        for bank in Bank::ALL {
            let count = cfg.bank_size(bank);
            if count > MAX_BANK_CELLS {
                return Err(Error::BankSize { bank, count });
            }
        }

        let open = |bank: Bank| -> Result<Segment, Error> {
            let name = format!("{}{}", cfg.name_prefix, bank.suffix());
            Segment::open(&name, cfg.bank_size(bank), bank.cell_bytes())
        };

        Ok(RegisterStore {
            segments: [
                open(Bank::DiscreteOutput)?,
                open(Bank::DiscreteInput)?,
                open(Bank::AnalogOutput)?,
                open(Bank::AnalogInput)?,
            ],
            prefix: cfg.name_prefix.clone(),
        })
    }

    fn segment(&self, bank: Bank) -> &Segment {
        &self.segments[bank.idx()]
    }

    /// Configured cell count of a bank.
    pub fn bank_size(&self, bank: Bank) -> usize {
        self.segment(bank).cells
    }

    /// Shared memory name prefix the segments were created with.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Read `count` coils starting at `address`. Nonzero bytes read as set
    /// (an external writer may store values other than 0 and 1).
    pub fn read_bits(&self, bank: Bank, address: u16, count: u16) -> Result<Vec<bool>, AddressError> {
        debug_assert_eq!(bank.cell_bytes(), 1);
        let seg = self.segment(bank);
        seg.check(bank, address, count as usize)?;
        let base = seg.shmem.as_ptr() as *const u8;
        let mut values = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            // volatile: the segment is concurrently written by other processes
            let v = unsafe { ptr::read_volatile(base.add(address as usize + i)) };
            values.push(v != 0);
        }
        Ok(values)
    }

    /// Write coils starting at `address`, immediately visible to every
    /// process attached to the segment. Not atomic across cells.
    pub fn write_bits(&self, bank: Bank, address: u16, values: &[bool]) -> Result<(), AddressError> {
        debug_assert_eq!(bank.cell_bytes(), 1);
        let seg = self.segment(bank);
        seg.check(bank, address, values.len())?;
        let base = seg.shmem.as_ptr();
        for (i, &v) in values.iter().enumerate() {
            unsafe { ptr::write_volatile(base.add(address as usize + i), u8::from(v)) };
        }
        Ok(())
    }

    /// Read `count` 16-bit registers starting at `address`.
    pub fn read_registers(
        &self,
        bank: Bank,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, AddressError> {
        debug_assert_eq!(bank.cell_bytes(), 2);
        let seg = self.segment(bank);
        seg.check(bank, address, count as usize)?;
        let base = seg.shmem.as_ptr() as *const u16;
        let mut values = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            values.push(unsafe { ptr::read_volatile(base.add(address as usize + i)) });
        }
        Ok(values)
    }

    /// Write 16-bit registers starting at `address`. Not atomic across cells.
    pub fn write_registers(
        &self,
        bank: Bank,
        address: u16,
        values: &[u16],
    ) -> Result<(), AddressError> {
        debug_assert_eq!(bank.cell_bytes(), 2);
        let seg = self.segment(bank);
        seg.check(bank, address, values.len())?;
        let base = seg.shmem.as_ptr() as *mut u16;
        for (i, &v) in values.iter().enumerate() {
            unsafe { ptr::write_volatile(base.add(address as usize + i), v) };
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::process;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Unique per-test shm prefix so parallel tests never collide.
    pub(crate) fn unique_prefix() -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        format!(
            "mbshm_test_{}_{}_",
            process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        )
    }

    fn small_store(prefix: &str) -> RegisterStore {
        RegisterStore::create(&StoreConfig {
            do_size: 8,
            di_size: 8,
            ao_size: 4,
            ai_size: 4,
            name_prefix: prefix.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn only_output_banks_are_master_writable() {
        assert!(Bank::DiscreteOutput.master_writable());
        assert!(Bank::AnalogOutput.master_writable());
        assert!(!Bank::DiscreteInput.master_writable());
        assert!(!Bank::AnalogInput.master_writable());
    }

    #[test]
    fn fresh_banks_read_zero() {
        let store = small_store(&unique_prefix());
        assert_eq!(store.read_bits(Bank::DiscreteOutput, 0, 8).unwrap(), vec![false; 8]);
        assert_eq!(store.read_registers(Bank::AnalogOutput, 0, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn register_round_trip() {
        let store = small_store(&unique_prefix());
        store
            .write_registers(Bank::AnalogOutput, 2, &[0x1234])
            .unwrap();
        assert_eq!(
            store.read_registers(Bank::AnalogOutput, 2, 2).unwrap(),
            vec![0x1234, 0]
        );
    }

    #[test]
    fn bit_round_trip() {
        let store = small_store(&unique_prefix());
        store
            .write_bits(Bank::DiscreteInput, 3, &[true, false, true])
            .unwrap();
        assert_eq!(
            store.read_bits(Bank::DiscreteInput, 2, 5).unwrap(),
            vec![false, true, false, true, false]
        );
    }

    #[test]
    fn out_of_bounds_is_address_error() {
        let store = small_store(&unique_prefix());
        let err = store.read_registers(Bank::AnalogOutput, 2, 4).unwrap_err();
        assert_eq!(
            err,
            AddressError {
                bank: Bank::AnalogOutput,
                address: 2,
                count: 4,
            }
        );
        assert!(store.write_registers(Bank::AnalogInput, 4, &[1]).is_err());
        assert!(store.read_bits(Bank::DiscreteOutput, 8, 1).is_err());
        assert!(store.write_bits(Bank::DiscreteOutput, 7, &[true, true]).is_err());
    }

    #[test]
    fn zero_size_bank_rejects_every_access() {
        let prefix = unique_prefix();
        let store = RegisterStore::create(&StoreConfig {
            do_size: 0,
            di_size: 0,
            ao_size: 0,
            ai_size: 0,
            name_prefix: prefix,
        })
        .unwrap();
        assert!(store.read_bits(Bank::DiscreteOutput, 0, 1).is_err());
        assert!(store.read_registers(Bank::AnalogInput, 0, 1).is_err());
        // a zero-count access of a zero bank is a no-op, not an error
        assert_eq!(store.read_registers(Bank::AnalogOutput, 0, 0).unwrap(), vec![]);
    }

    #[test]
    fn oversized_bank_is_rejected() {
        let err = RegisterStore::create(&StoreConfig {
            ao_size: MAX_BANK_CELLS + 1,
            name_prefix: unique_prefix(),
            ..StoreConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::BankSize { bank: Bank::AnalogOutput, count } if count == MAX_BANK_CELLS + 1));
    }

    #[test]
    fn writes_are_visible_through_an_independent_mapping() {
        // The external-process view: attach a second mapping of the same
        // os id and inspect the raw bytes.
        let prefix = unique_prefix();
        let store = small_store(&prefix);
        store
            .write_registers(Bank::AnalogOutput, 1, &[0xBEEF])
            .unwrap();
        store.write_bits(Bank::DiscreteOutput, 5, &[true]).unwrap();

        let ao = ShmemConf::new()
            .os_id(format!("{}AO", prefix))
            .open()
            .unwrap();
        let word = unsafe { ptr::read_volatile((ao.as_ptr() as *const u16).add(1)) };
        assert_eq!(word, 0xBEEF);

        let dobj = ShmemConf::new()
            .os_id(format!("{}DO", prefix))
            .open()
            .unwrap();
        assert_eq!(unsafe { ptr::read_volatile(dobj.as_ptr().add(5)) }, 1);

        // and the other way around
        unsafe { ptr::write_volatile((ao.as_ptr() as *mut u16).add(3), 0x0042) };
        assert_eq!(
            store.read_registers(Bank::AnalogOutput, 3, 1).unwrap(),
            vec![0x0042]
        );
    }

    #[test]
    fn drop_unlinks_owned_segments() {
        let prefix = unique_prefix();
        let store = small_store(&prefix);
        assert!(ShmemConf::new()
            .os_id(format!("{}DO", prefix))
            .open()
            .is_ok());

        drop(store);
        for bank in Bank::ALL {
            assert!(
                ShmemConf::new()
                    .os_id(format!("{}{}", prefix, bank.suffix()))
                    .open()
                    .is_err(),
                "{} object must be unlinked after drop",
                bank
            );
        }
    }

    #[test]
    fn dropping_an_attached_store_keeps_the_owner_segments() {
        let prefix = unique_prefix();
        let owner = small_store(&prefix);
        // same prefix and sizes: attaches to the existing objects
        let attached = small_store(&prefix);
        drop(attached);

        assert!(ShmemConf::new()
            .os_id(format!("{}AO", prefix))
            .open()
            .is_ok());
        owner
            .write_registers(Bank::AnalogOutput, 0, &[1])
            .unwrap();
    }

    #[test]
    fn attaching_with_a_larger_size_fails() {
        let prefix = unique_prefix();
        let _small = small_store(&prefix);
        // The DO object exists with 8 cells; asking for the full address
        // space cannot be satisfied by attaching to it.
        let err = RegisterStore::create(&StoreConfig {
            name_prefix: prefix,
            ..StoreConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::SegmentSize { .. }));
    }
}
