//! Local control interface over the configuration record.
//!
//! Requests arrive as ioctl-style numbers plus an argument buffer and
//! are dispatched against the [`ConfigStore`]. Display and USB mode
//! changes persist with a restart; account changes persist without.
use crate::{
    devices::eeprom::{record::UID_LENGTH, ConfigStore},
    error::Error,
    hal::{flash::Flash, system::Platform},
};
use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};
use std::sync::Arc;

pub const IOCTL_TYPE: u8 = 133;
/// Server name bytes carried by a bind request.
pub const BIND_SERVER_LENGTH: usize = 420;
pub const BIND_LENGTH: usize = UID_LENGTH + BIND_SERVER_LENGTH;

const IOC_READ: u32 = 2;

/// Builds the `_IOR(133, nr, char *)` request number.
pub const fn ioctl_number(nr: u8) -> u32 {
    (IOC_READ << 30) | ((core::mem::size_of::<usize>() as u32) << 16) | ((IOCTL_TYPE as u32) << 8) | nr as u32
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    UpdateFirmware,
    GetHidSpeed,
    SetHidSpeed(u32),
    GetResolution,
    /// Width in the low half, height in the high half.
    SetResolution(u32),
    BindDevice { uid: [u8; UID_LENGTH], server: [u8; BIND_SERVER_LENGTH] },
    UnbindDevice,
    GetDeviceSerial,
    GetRecord,
    ResetRecord,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlResponse {
    Done,
    Value(u32),
    Bytes(Vec<u8>),
}

fn word(argument: &[u8]) -> Result<u32, Error> {
    argument.get(..4).map(LittleEndian::read_u32).ok_or(Error::Malformed("ioctl argument"))
}

impl ControlRequest {
    /// Decodes a request number and its argument. Direction and size
    /// bits are not checked.
    pub fn from_ioctl(number: u32, argument: &[u8]) -> Result<Self, Error> {
        if (number >> 8) & 0xFF != IOCTL_TYPE as u32 {
            return Err(Error::Malformed("ioctl type"));
        }
        Ok(match number & 0xFF {
            0 => ControlRequest::UpdateFirmware,
            1 => ControlRequest::GetHidSpeed,
            2 => ControlRequest::SetHidSpeed(word(argument)?),
            3 => ControlRequest::GetResolution,
            4 => ControlRequest::SetResolution(word(argument)?),
            5 => {
                let bytes = argument.get(..BIND_LENGTH).ok_or(Error::Malformed("bind argument"))?;
                let mut uid = [0u8; UID_LENGTH];
                let mut server = [0u8; BIND_SERVER_LENGTH];
                uid.copy_from_slice(&bytes[..UID_LENGTH]);
                server.copy_from_slice(&bytes[UID_LENGTH..]);
                ControlRequest::BindDevice { uid, server }
            }
            6 => ControlRequest::UnbindDevice,
            7 => ControlRequest::GetDeviceSerial,
            80 => ControlRequest::GetRecord,
            81 => ControlRequest::ResetRecord,
            _ => return Err(Error::Malformed("ioctl number")),
        })
    }
}

/// Starts a firmware update from the on-device image file.
pub trait LocalUpdate: Send + Sync {
    /// Returns false when an update is already in flight.
    fn update_from_file(&self) -> bool;
}

pub struct Control<F: Flash + Send + 'static> {
    store: Arc<ConfigStore<F>>,
    platform: Arc<dyn Platform>,
    updater: Option<Arc<dyn LocalUpdate>>,
}

impl<F: Flash + Send + 'static> Control<F> {
    pub fn new(
        store: Arc<ConfigStore<F>>,
        platform: Arc<dyn Platform>,
        updater: Option<Arc<dyn LocalUpdate>>,
    ) -> Self {
        Self { store, platform, updater }
    }

    pub fn dispatch(&self, request: ControlRequest) -> Result<ControlResponse, Error> {
        match request {
            ControlRequest::UpdateFirmware => {
                match &self.updater {
                    Some(updater) if updater.update_from_file() => info!("Local firmware update started"),
                    Some(_) => info!("Firmware update already in flight"),
                    None => warn!("No updater attached, ignoring firmware update request"),
                }
                Ok(ControlResponse::Done)
            }
            ControlRequest::GetHidSpeed => {
                Ok(ControlResponse::Value(self.store.read(|r| r.usb.hid_2_0 as u32)))
            }
            ControlRequest::SetHidSpeed(mode) => {
                self.store.mutate(|r| r.usb.hid_2_0 = u8::from(mode != 0));
                self.store.persist(true);
                Ok(ControlResponse::Done)
            }
            ControlRequest::GetResolution => Ok(ControlResponse::Value(self.store.read(|r| {
                (r.edid.width as u16 as u32) | ((r.edid.height as u16 as u32) << 16)
            }))),
            ControlRequest::SetResolution(packed) => {
                let (width, height) = (packed & 0xFFFF, packed >> 16);
                info!("Setting resolution {} x {}", width, height);
                self.store.mutate(|r| {
                    r.edid.width = width;
                    r.edid.height = height;
                });
                self.store.persist(true);
                Ok(ControlResponse::Done)
            }
            ControlRequest::BindDevice { uid, server } => {
                self.store.mutate(|r| {
                    r.account.device_bound = 1;
                    r.account.uid = uid;
                    r.account.cloud_server[..BIND_SERVER_LENGTH].copy_from_slice(&server);
                    r.account.custom_cloud_server = u8::from(!r.cloud_server().is_empty());
                });
                info!("Device bound, custom server: {}", self.store.read(|r| r.account.custom_cloud_server != 0));
                self.store.persist(false);
                Ok(ControlResponse::Done)
            }
            ControlRequest::UnbindDevice => {
                self.store.mutate(|r| {
                    r.account.device_bound = 0;
                    r.account.uid = [0; UID_LENGTH];
                });
                info!("Device unbound");
                self.store.persist(false);
                Ok(ControlResponse::Done)
            }
            ControlRequest::GetDeviceSerial => {
                let serial = self.platform.serial_number();
                let known = LittleEndian::read_u32(&serial[..4]) > 0 && LittleEndian::read_u32(&serial[4..]) > 0;
                Ok(if known { ControlResponse::Bytes(serial.to_vec()) } else { ControlResponse::Done })
            }
            ControlRequest::GetRecord => Ok(ControlResponse::Bytes(self.store.read(|r| r.encode().to_vec()))),
            ControlRequest::ResetRecord => {
                self.store.mutate(|r| *r = crate::devices::eeprom::Record::zeroed());
                info!("Configuration record reset");
                self.store.persist(false);
                Ok(ControlResponse::Done)
            }
        }
    }
}
