//! Persistent configuration record store.
//!
//! The record is read once when the store opens and then lives in
//! memory. Every mutation goes through one lock around the whole
//! record. Persisting is debounced: requests inside the window are
//! merged into a single erase+program of the record's erase block,
//! optionally followed by a device restart.
use crate::{
    config::{Settings, SettleRange},
    error::Error,
    hal::{
        flash::{Flash, FlashDevice, FlashRegion},
        system::Restart,
    },
    utilities::{bitwise::is_erased, memory::align_up, worker::Debouncer},
};
use log::{debug, error, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
};

pub mod record;

pub use record::{Provenance, Record, RECORD_SIZE};

const BOOTLOADER_PARTITION: usize = 0;
const CONFIG_PARTITION: usize = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PersistState {
    Idle,
    Scheduled,
    Writing,
    /// A restart has been requested; terminal for the process.
    Rebooting,
}

struct Inner<F> {
    record: Mutex<Record>,
    region: Option<FlashRegion<F>>,
    state: Mutex<PersistState>,
    restart_requested: AtomicBool,
    /// Outcome of the most recent write-out.
    failure: Mutex<Option<Error>>,
    record_offset: usize,
    settle: SettleRange,
    restart: Arc<dyn Restart>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> { mutex.lock().unwrap_or_else(PoisonError::into_inner) }

impl<F: Flash> Inner<F> {
    fn set_state(&self, state: PersistState) { *locked(&self.state) = state }

    fn write_out(&self) {
        let restart = self.restart_requested.swap(false, Ordering::SeqCst);
        let region = match &self.region {
            Some(region) => region,
            None => {
                warn!("No configuration partition, dropping record write");
                self.set_state(PersistState::Idle);
                return;
            }
        };
        self.set_state(PersistState::Writing);
        let image = locked(&self.record).encode();

        let outcome = write_record(region, self.record_offset, &image);
        *locked(&self.failure) = outcome.err();
        match outcome {
            Ok(()) => debug!("Configuration record written"),
            Err(e) => {
                error!("Failed to write configuration record: {}", e);
                self.set_state(PersistState::Idle);
                return;
            }
        }

        if restart {
            self.set_state(PersistState::Rebooting);
            thread::sleep(self.settle.pick());
            info!("Restarting to apply configuration");
            self.restart.restart();
        } else {
            self.set_state(PersistState::Idle);
        }
    }
}

fn write_record<F: Flash>(region: &FlashRegion<F>, offset: usize, image: &[u8]) -> Result<(), Error> {
    region.exclusive(|flash: &mut F| -> Result<(), Error> {
        let span = align_up(image.len(), flash.erase_size());
        let mut block = vec![0u8; span];
        block[..image.len()].copy_from_slice(image);
        nb::block!(flash.erase(offset, span))?;
        nb::block!(flash.program(offset, &block))?;
        Ok(())
    })
}

fn read_record<F: Flash>(region: &FlashRegion<F>, offset: usize) -> Result<(Record, Provenance), Error> {
    let mut image = [0u8; RECORD_SIZE];
    region.exclusive(|flash| nb::block!(flash.read(offset, &mut image)))?;
    if is_erased(&image) {
        debug!("Configuration partition is erased");
    }
    Ok(Record::decode(&image))
}

/// Finds the configuration partition, which must follow a bootloader
/// partition of the expected size.
fn locate<D: FlashDevice + ?Sized>(device: &D, settings: &Settings) -> Result<FlashRegion<D::Flash>, Error> {
    let partitions = device.partitions();
    let bootloader = partitions.get(BOOTLOADER_PARTITION).ok_or(Error::MediaMissing("bootloader partition"))?;
    if bootloader.size != settings.layout.bootloader_size {
        warn!(
            "Bootloader partition is {:#010X} bytes, expected {:#010X}",
            bootloader.size, settings.layout.bootloader_size
        );
        return Err(Error::MediaMissing("configuration partition at the expected offset"));
    }
    device.partition(CONFIG_PARTITION).ok_or(Error::MediaMissing("configuration partition"))
}

pub struct ConfigStore<F: Flash + Send + 'static> {
    inner: Arc<Inner<F>>,
    provenance: Provenance,
    debouncer: Debouncer,
}

impl<F: Flash + Send + 'static> ConfigStore<F> {
    /// Loads the record from its partition. A missing or misdetected
    /// partition leaves the store in degraded mode with a default
    /// record; only failing to start the persist thread is an error.
    pub fn open<D>(device: &D, settings: &Settings, restart: Arc<dyn Restart>) -> Result<Self, Error>
    where
        D: FlashDevice<Flash = F> + ?Sized,
    {
        let record_offset = settings.record_offset as usize;
        let region = match locate(device, settings) {
            Ok(region) => Some(region),
            Err(e) => {
                warn!("Configuration persistence disabled: {}", e);
                None
            }
        };

        let (record, provenance) = match &region {
            Some(region) => read_record(region, record_offset).unwrap_or_else(|e| {
                warn!("Failed to read configuration record: {}", e);
                (Record::default(), Provenance::Blank)
            }),
            None => (Record::default(), Provenance::Blank),
        };
        info!("Configuration record loaded ({:?})", provenance);

        let debouncer = Debouncer::spawn("config-persist", settings.persist_delay())?;
        let inner = Arc::new(Inner {
            record: Mutex::new(record),
            region,
            state: Mutex::new(PersistState::Idle),
            restart_requested: AtomicBool::new(false),
            failure: Mutex::new(None),
            record_offset,
            settle: settings.record_settle,
            restart,
        });
        Ok(Self { inner, provenance, debouncer })
    }

    pub fn is_degraded(&self) -> bool { self.inner.region.is_none() }
    pub fn provenance(&self) -> Provenance { self.provenance }
    pub fn state(&self) -> PersistState { *locked(&self.inner.state) }

    /// Error of the last write-out, cleared by the next successful one.
    pub fn last_failure(&self) -> Option<Error> { *locked(&self.inner.failure) }

    /// Snapshot of the in-memory record.
    pub fn record(&self) -> Record { *locked(&self.inner.record) }

    pub fn read<R>(&self, view: impl FnOnce(&Record) -> R) -> R { view(&*locked(&self.inner.record)) }

    /// Applies `change` to the in-memory record under the store lock.
    pub fn mutate<R>(&self, change: impl FnOnce(&mut Record) -> R) -> R {
        change(&mut *locked(&self.inner.record))
    }

    /// Schedules a write-out of the current record. Requests arriving
    /// before the window closes restart it; a restart requested by any
    /// of them is honoured once the write succeeds.
    pub fn persist(&self, restart: bool) {
        if restart {
            self.inner.restart_requested.store(true, Ordering::SeqCst);
        }
        let mut state = locked(&self.inner.state);
        if *state == PersistState::Rebooting {
            debug!("Restart pending, ignoring persist request");
            return;
        }
        *state = PersistState::Scheduled;
        drop(state);

        let inner = Arc::clone(&self.inner);
        if !self.debouncer.arm(move || inner.write_out()) {
            error!("Persist thread is gone, record not scheduled");
        }
    }

    /// Runs a scheduled write immediately.
    pub fn flush(&self) { self.debouncer.flush() }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::SettleRange,
        hal::{
            doubles::{
                flash::{FakeFlashDevice, FaultKind, Operation},
                system::FakeRestart,
            },
            flash::FlashError,
        },
    };

    fn quick_settings() -> Settings {
        Settings {
            persist_delay_ms: 60_000,
            record_settle: SettleRange::new(0, 0),
            ..Default::default()
        }
    }

    fn device() -> FakeFlashDevice {
        FakeFlashDevice::new(&[kb!(32), kb!(16), kb!(160)], kb!(4))
    }

    fn open(device: &FakeFlashDevice, restart: &FakeRestart) -> ConfigStore<crate::hal::doubles::flash::FakeFlash> {
        ConfigStore::open(device, &quick_settings(), Arc::new(restart.clone())).unwrap()
    }

    #[test]
    fn blank_flash_loads_the_default_record() {
        let store = open(&device(), &FakeRestart::default());
        assert!(!store.is_degraded());
        assert_eq!(store.provenance(), Provenance::Blank);
        assert_eq!(store.record(), Record::default());
    }

    #[test]
    fn persisted_records_survive_a_reload() {
        // Given
        let device = device();
        let restart = FakeRestart::default();
        let store = open(&device, &restart);

        // When
        store.mutate(|record| {
            record.edid.width = 1920;
            record.edid.height = 1080;
        });
        store.persist(false);
        store.flush();

        // Then
        assert_eq!(store.state(), PersistState::Idle);
        assert_eq!(store.last_failure(), None);
        let reloaded = open(&device, &restart);
        assert_eq!(reloaded.provenance(), Provenance::Current);
        assert_eq!(reloaded.record().edid.width, 1920);
        assert_eq!(reloaded.record().edid.height, 1080);
        assert_eq!(restart.requests(), 0);
    }

    #[test]
    fn bursts_of_requests_become_one_write_with_merged_restart() {
        // Given
        let device = device();
        let restart = FakeRestart::default();
        let store = open(&device, &restart);
        device.clear_operations();

        // When
        store.persist(true);
        store.persist(false);
        assert_eq!(store.state(), PersistState::Scheduled);
        store.flush();

        // Then
        assert_eq!(device.writes(), [
            Operation::Erase { address: kb!(32), length: kb!(4) },
            Operation::Program { address: kb!(32), length: kb!(4) },
        ]);
        assert_eq!(restart.requests(), 1);
        assert_eq!(store.state(), PersistState::Rebooting);
    }

    #[test]
    fn failed_writes_keep_the_record_and_skip_the_restart() {
        let device = device();
        let restart = FakeRestart::default();
        let store = open(&device, &restart);
        device.fail_after(FaultKind::Erase, 0);

        store.mutate(|record| record.usb.hid_2_0 = 1);
        store.persist(true);
        store.flush();

        assert_eq!(restart.requests(), 0);
        assert_eq!(store.state(), PersistState::Idle);
        assert_eq!(store.last_failure(), Some(Error::Media(FlashError::EraseFailed)));
        assert_eq!(store.record().usb.hid_2_0, 1);
        assert!(device.contents()[kb!(32)..kb!(48)].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn misdetected_layouts_run_degraded() {
        // Given
        let device = FakeFlashDevice::new(&[kb!(64), kb!(16), kb!(160)], kb!(4));
        let restart = FakeRestart::default();

        // When
        let store = open(&device, &restart);
        store.mutate(|record| record.usb.hid_2_0 = 1);
        store.persist(true);
        store.flush();

        // Then
        assert!(store.is_degraded());
        assert_eq!(store.record().usb.hid_2_0, 1);
        assert!(device.writes().is_empty());
        assert_eq!(restart.requests(), 0);
    }
}
