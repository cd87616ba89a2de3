//! In-memory flash device with NOR semantics: erasing sets bytes
//! to 0xFF and programming may only clear bits. Every operation is
//! logged with its absolute device address so tests can assert on
//! the exact erase/program sequence.
use crate::{
    hal::flash::{check_erase_range, check_range, Flash, FlashDevice, FlashError, FlashRegion, Partition},
    utilities::bitwise::programmable_over,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Read { address: usize, length: usize },
    Erase { address: usize, length: usize },
    Program { address: usize, length: usize },
    Lock,
    Unlock,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Erase,
    Program,
}

struct Storage {
    memory: Vec<u8>,
    operations: Vec<Operation>,
    fault: Option<(FaultKind, usize)>,
}

impl Storage {
    /// Counts down the armed fault, returning true when this operation must fail.
    fn trips(&mut self, kind: FaultKind) -> bool {
        let trips = match &mut self.fault {
            Some((armed, remaining)) if *armed == kind => {
                if *remaining == 0 {
                    true
                } else {
                    *remaining -= 1;
                    false
                }
            }
            _ => false,
        };
        if trips {
            self.fault = None;
        }
        trips
    }
}

type Shared = Arc<Mutex<Storage>>;

fn storage(shared: &Shared) -> MutexGuard<'_, Storage> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// View of the fake device starting at `base`.
pub struct FakeFlash {
    storage: Shared,
    base: usize,
    size: usize,
    erase_size: usize,
}

impl Flash for FakeFlash {
    fn read(&mut self, address: usize, bytes: &mut [u8]) -> nb::Result<(), FlashError> {
        check_range(address, bytes.len(), self.size)?;
        let mut storage = storage(&self.storage);
        let start = self.base + address;
        storage.operations.push(Operation::Read { address: start, length: bytes.len() });
        bytes.copy_from_slice(&storage.memory[start..start + bytes.len()]);
        Ok(())
    }

    fn erase(&mut self, address: usize, length: usize) -> nb::Result<(), FlashError> {
        check_erase_range(address, length, self.erase_size, self.size)?;
        let mut storage = storage(&self.storage);
        let start = self.base + address;
        storage.operations.push(Operation::Erase { address: start, length });
        if storage.trips(FaultKind::Erase) {
            return Err(nb::Error::Other(FlashError::EraseFailed));
        }
        storage.memory[start..start + length].iter_mut().for_each(|b| *b = 0xFF);
        Ok(())
    }

    fn program(&mut self, address: usize, bytes: &[u8]) -> nb::Result<usize, FlashError> {
        check_range(address, bytes.len(), self.size)?;
        let mut storage = storage(&self.storage);
        let start = self.base + address;
        storage.operations.push(Operation::Program { address: start, length: bytes.len() });
        if storage.trips(FaultKind::Program) {
            return Err(nb::Error::Other(FlashError::ProgramFailed));
        }
        let target = &mut storage.memory[start..start + bytes.len()];
        if !programmable_over(bytes, target) {
            return Err(nb::Error::Other(FlashError::NotErased));
        }
        target.copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn erase_size(&self) -> usize { self.erase_size }
    fn size(&self) -> usize { self.size }
    fn lock(&mut self) { storage(&self.storage).operations.push(Operation::Lock) }
    fn unlock(&mut self) { storage(&self.storage).operations.push(Operation::Unlock) }
}

/// Fake chip carved into consecutive partitions.
pub struct FakeFlashDevice {
    storage: Shared,
    partitions: Vec<Partition>,
    regions: Vec<FlashRegion<FakeFlash>>,
    whole: Option<FlashRegion<FakeFlash>>,
}

impl FakeFlashDevice {
    /// Builds a device exactly as large as the sum of its partitions.
    pub fn new(sizes: &[u32], erase_size: u32) -> Self {
        let parent_size = sizes.iter().sum();
        Self::with_parent_size(sizes, erase_size, parent_size)
    }

    pub fn with_parent_size(sizes: &[u32], erase_size: u32, parent_size: u32) -> Self {
        let storage = Arc::new(Mutex::new(Storage {
            memory: vec![0xFF; parent_size as usize],
            operations: Vec::new(),
            fault: None,
        }));
        let partitions = Partition::sequence(sizes, erase_size, parent_size);
        let view = |base: u32, size: u32| {
            FlashRegion::new(FakeFlash {
                storage: Arc::clone(&storage),
                base: base as usize,
                size: size as usize,
                erase_size: erase_size as usize,
            })
        };
        let regions = partitions
            .iter()
            .map(|p| view(p.offset, p.size.min(parent_size.saturating_sub(p.offset))))
            .collect();
        let whole = Some(view(0, parent_size));
        Self { storage, partitions, regions, whole }
    }

    /// Hides the whole-device region, as when the parent device can't be opened.
    pub fn without_whole_device(mut self) -> Self {
        self.whole = None;
        self
    }

    pub fn operations(&self) -> Vec<Operation> { storage(&self.storage).operations.clone() }

    /// Erase and program operations only, in issue order.
    pub fn writes(&self) -> Vec<Operation> {
        self.operations()
            .into_iter()
            .filter(|op| matches!(op, Operation::Erase { .. } | Operation::Program { .. }))
            .collect()
    }

    pub fn clear_operations(&self) { storage(&self.storage).operations.clear() }

    pub fn contents(&self) -> Vec<u8> { storage(&self.storage).memory.clone() }

    /// Writes directly into the backing memory, bypassing NOR rules and the log.
    pub fn write_raw(&self, address: usize, bytes: &[u8]) {
        storage(&self.storage).memory[address..address + bytes.len()].copy_from_slice(bytes);
    }

    /// Makes the operation of `kind` that follows `successes` successful ones fail.
    pub fn fail_after(&self, kind: FaultKind, successes: usize) {
        storage(&self.storage).fault = Some((kind, successes));
    }
}

impl FlashDevice for FakeFlashDevice {
    type Flash = FakeFlash;

    fn partitions(&self) -> Vec<Partition> { self.partitions.clone() }

    fn partition(&self, index: usize) -> Option<FlashRegion<FakeFlash>> {
        self.regions.get(index).cloned()
    }

    fn whole(&self) -> Option<FlashRegion<FakeFlash>> { self.whole.clone() }
}
