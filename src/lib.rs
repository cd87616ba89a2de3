//! # AURGA Gadget Firmware Library
//!
//! This crate contains the firmware update and device configuration
//! functionality of the AURGA keyboard/mouse/touchscreen gadget in
//! library form: the vendor HID update channel, the staging and
//! verification of uploaded images, the flash commit engine and the
//! versioned configuration record kept in its own flash partition.
#![cfg_attr(test, allow(unused_imports))]

extern crate static_assertions;

#[macro_use]
pub mod utilities {
    pub mod bitwise;
    pub mod guard;
    pub mod memory;
    pub mod worker;
}

pub mod config;
pub mod devices;
pub mod drivers;
pub mod error;
pub mod hal;
