//! Vendor HID front-end of the firmware update pipeline.
//!
//! Reports are handled synchronously on the caller's thread; staging
//! allocation and commits are queued on a background worker. At most
//! one commit is in flight at a time.
use crate::{
    config::Settings,
    devices::{
        control::LocalUpdate,
        firmware::{
            commit::{self, CommitPlan},
            source::{FileImage, ImageSource, StagedImage},
            staging::StagingBuffer,
            Phase, Session, TransferRequest, DIGEST_LENGTH,
        },
        indicator::StatusIndicator,
        protocol::{parse_header, parse_request, Reply, Request, Status, SystemInfo},
        topology::Topology,
    },
    error::Error,
    hal::{
        flash::FlashDevice,
        system::{Platform, Processes, Restart},
    },
    utilities::worker::Worker,
};
use log::{debug, error, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
};

/// Side I/O collaborators of the update pipeline.
#[derive(Clone)]
pub struct Peripherals {
    pub restart: Arc<dyn Restart>,
    pub processes: Arc<dyn Processes>,
    pub platform: Arc<dyn Platform>,
    pub indicator: Arc<StatusIndicator>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    pub status: Status,
    pub bytes: u32,
}

#[derive(Default)]
struct Slot {
    session: Option<Session>,
    prepared: bool,
}

struct Shared<D> {
    device: Arc<D>,
    settings: Settings,
    peripherals: Peripherals,
    slot: Mutex<Slot>,
    committing: AtomicBool,
    progress: Mutex<Progress>,
    sessions: AtomicU64,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> { mutex.lock().unwrap_or_else(PoisonError::into_inner) }

impl<D: FlashDevice> Shared<D> {
    /// Granularity of the staging buffer: the device's erase size when
    /// it can report one.
    fn staging_granularity(&self) -> usize {
        self.device
            .whole()
            .map(|region| region.erase_size())
            .filter(|size| *size > 0)
            .unwrap_or(self.settings.erase_block_size as usize)
    }

    fn allocate(&self, id: u64) {
        let length = match &locked(&self.slot).session {
            Some(session) if session.id() == id => session.request().length,
            _ => {
                debug!("Session {} replaced before allocation", id);
                return;
            }
        };
        let result = StagingBuffer::allocate(length, self.staging_granularity(), self.settings.max_staging_bytes);
        let mut slot = locked(&self.slot);
        match (slot.session.as_mut(), result) {
            (Some(session), Ok(buffer)) if session.id() == id => session.attach(buffer),
            (Some(session), Err(e)) if session.id() == id => warn!("Staging allocation failed: {}", e),
            _ => debug!("Discarding staging buffer of replaced session {}", id),
        }
    }

    fn set_progress(&self, status: Status, bytes: u32) { *locked(&self.progress) = Progress { status, bytes } }

    fn set_progress_bytes(&self, bytes: u32) { locked(&self.progress).bytes = bytes }

    fn try_commit<S: ImageSource + ?Sized>(&self, request: &TransferRequest, source: &mut S) -> Result<(), Error> {
        let region = self.device.whole().ok_or(Error::MediaMissing("whole flash device"))?;
        let topology = Topology::discover(&*self.device);
        let plan = CommitPlan::build(request, &topology, region.erase_size(), &self.settings, source)?;
        commit::execute(&plan, &region, source, |bytes| self.set_progress_bytes(bytes))
    }

    /// Commits `source` and restarts on success. Always leaves the
    /// pipeline idle and ready for a new session afterwards.
    fn commit<S: ImageSource + ?Sized>(&self, request: TransferRequest, source: &mut S) {
        match self.try_commit(&request, source) {
            Ok(()) => {
                let bytes = locked(&self.progress).bytes;
                self.set_progress(Status::Updated, bytes);
                info!("Firmware written, restarting");
                thread::sleep(self.settings.commit_settle.pick());
                self.peripherals.restart.restart();
            }
            Err(e) => {
                error!("Firmware commit aborted: {}", e);
                let bytes = locked(&self.progress).bytes;
                self.set_progress(e.status(), bytes);
            }
        }
        self.peripherals.indicator.stop();
        {
            let mut slot = locked(&self.slot);
            if slot.session.as_ref().map_or(false, |s| s.phase() == Phase::Committing) {
                slot.session = None;
            }
            slot.prepared = false;
        }
        self.committing.store(false, Ordering::SeqCst);
    }

    fn update_from_file(&self) {
        let mut image = match FileImage::open(&self.settings.firmware_file) {
            Ok(image) => image,
            Err(e) => {
                warn!("Firmware file {:?} unusable: {}", self.settings.firmware_file, e);
                self.committing.store(false, Ordering::SeqCst);
                return;
            }
        };
        let length = match u32::try_from(image.len()) {
            Ok(length) => length,
            Err(_) => {
                warn!("Firmware file {:?} exceeds the flash address space", self.settings.firmware_file);
                self.committing.store(false, Ordering::SeqCst);
                return;
            }
        };
        info!("Updating from {:?} ({} bytes)", self.settings.firmware_file, length);
        let terminated = self.peripherals.processes.terminate_matching(&self.settings.consumer_prefix);
        debug!("Terminated {} consumer processes", terminated);
        thread::sleep(self.settings.consumer_settle.pick());
        if let Err(e) = self.peripherals.indicator.start() {
            warn!("{}", e);
        }
        self.set_progress(Status::Ok, 0);
        let request = TransferRequest { flash_offset: 0, length, digest: [0; DIGEST_LENGTH] };
        self.commit(request, &mut image);
    }
}

pub struct UpdateService<D: FlashDevice> {
    shared: Arc<Shared<D>>,
    worker: Worker,
}

impl<D: FlashDevice> UpdateService<D> {
    pub fn new(device: Arc<D>, settings: Settings, peripherals: Peripherals) -> Result<Self, Error> {
        let worker = Worker::spawn("firmware-update")?;
        let shared = Arc::new(Shared {
            device,
            settings,
            peripherals,
            slot: Mutex::new(Slot::default()),
            committing: AtomicBool::new(false),
            progress: Mutex::new(Progress { status: Status::Ok, bytes: 0 }),
            sessions: AtomicU64::new(0),
        });
        Ok(Self { shared, worker })
    }

    /// Handles one report, returning the reply to publish. Reports for
    /// another channel, and reboots, get no reply.
    pub fn handle_report(&self, report: &[u8]) -> Option<Reply> {
        let (payload, command) = parse_header(report).ok()?;
        let mut reply = Reply::new(command);
        let request = match parse_request(command, payload) {
            Ok(Request::Reboot) => {
                info!("Reboot requested by host");
                self.shared.peripherals.restart.restart();
                return None;
            }
            Ok(request) => request,
            Err(e) => {
                warn!("Command {:#04X} rejected: {}", command, e);
                reply.set_status(e.status());
                return Some(reply);
            }
        };

        let outcome = match request {
            Request::QueryStatus => self.query_status(&mut reply),
            Request::PrepareStage1 => self.prepare_stage1(),
            Request::PrepareStage2(request) => self.prepare_stage2(request),
            Request::Upload { offset, data } => self.upload(offset, data),
            Request::EndUpload { .. } => self.end_upload(),
            Request::UpdateFirmware => self.update_firmware(),
            Request::GetUpdateProgress => self.write_progress(&mut reply),
            Request::GetFwVersion => {
                reply.write_version(&self.shared.settings.build_version);
                Ok(())
            }
            Request::Reboot | Request::Unknown(_) => {
                debug!("Ignoring command {:#04X}", command);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            debug!("Command {:#04X} failed: {}", command, e);
            reply.set_status(e.status());
        }
        Some(reply)
    }

    fn query_status(&self, reply: &mut Reply) -> Result<(), Error> {
        let platform = &self.shared.peripherals.platform;
        let chip_type = SystemInfo::chip_type(platform.memory_kb());
        let topology = Topology::discover(&*self.shared.device);
        debug!("Chip type {:#04X}, {} partitions", chip_type, topology.partitions().len());
        topology.system_info(chip_type, platform.serial_number()).encode(reply.payload_mut())
    }

    fn prepare_stage1(&self) -> Result<(), Error> {
        let terminated =
            self.shared.peripherals.processes.terminate_matching(&self.shared.settings.consumer_prefix);
        debug!("Terminated {} consumer processes", terminated);
        locked(&self.shared.slot).prepared = true;
        Ok(())
    }

    fn prepare_stage2(&self, request: TransferRequest) -> Result<(), Error> {
        let id = {
            let mut slot = locked(&self.shared.slot);
            if self.shared.committing.load(Ordering::SeqCst) {
                return Err(Error::Busy);
            }
            let id = self.shared.sessions.fetch_add(1, Ordering::SeqCst) + 1;
            slot.session = Some(Session::new(id, request));
            id
        };
        info!("Session {}: {} bytes for flash offset {:#010X}", id, request.length, request.flash_offset);
        debug!("Expected digest {:02X?}", request.digest);

        let shared = Arc::clone(&self.shared);
        if !self.worker.schedule(move || shared.allocate(id)) {
            return Err(Error::BufferNotReady);
        }
        if let Err(e) = self.shared.peripherals.indicator.start() {
            warn!("{}", e);
        }
        Ok(())
    }

    fn upload(&self, offset: u32, data: &[u8]) -> Result<(), Error> {
        locked(&self.shared.slot).session.as_mut().ok_or(Error::BufferNotReady)?.write_chunk(offset, data)
    }

    fn end_upload(&self) -> Result<(), Error> {
        locked(&self.shared.slot).session.as_mut().ok_or(Error::BufferNotReady)?.end_upload()
    }

    fn update_firmware(&self) -> Result<(), Error> {
        let (request, buffer) = {
            let mut slot = locked(&self.shared.slot);
            if self.shared.committing.load(Ordering::SeqCst) {
                return Err(Error::Busy);
            }
            let taken = slot.session.as_mut().ok_or(Error::FirmwareNotReady)?.take_verified()?;
            self.shared.committing.store(true, Ordering::SeqCst);
            taken
        };
        self.shared.set_progress(Status::Ok, 0);

        let shared = Arc::clone(&self.shared);
        let scheduled = self.worker.schedule(move || {
            let mut image = StagedImage::new(buffer);
            shared.commit(request, &mut image);
        });
        if !scheduled {
            self.shared.committing.store(false, Ordering::SeqCst);
            return Err(Error::FirmwareNotReady);
        }
        Ok(())
    }

    fn write_progress(&self, reply: &mut Reply) -> Result<(), Error> {
        let progress = self.progress();
        reply.set_status(progress.status);
        reply.write_progress(progress.bytes)
    }

    pub fn progress(&self) -> Progress { *locked(&self.shared.progress) }

    pub fn phase(&self) -> Phase {
        if self.shared.committing.load(Ordering::SeqCst) {
            return Phase::Committing;
        }
        let slot = locked(&self.shared.slot);
        match &slot.session {
            Some(session) => session.phase(),
            None if slot.prepared => Phase::Prepared,
            None => Phase::Idle,
        }
    }

    pub fn is_committing(&self) -> bool { self.shared.committing.load(Ordering::SeqCst) }

    /// Blocks until queued allocations and commits have finished.
    pub fn wait_idle(&self) { self.worker.wait_idle() }
}

impl<D: FlashDevice> LocalUpdate for UpdateService<D> {
    fn update_from_file(&self) -> bool {
        if self.shared.committing.swap(true, Ordering::SeqCst) {
            return false;
        }
        let shared = Arc::clone(&self.shared);
        if !self.worker.schedule(move || shared.update_from_file()) {
            self.shared.committing.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }
}
