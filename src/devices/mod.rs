//! Engines of the gadget: the firmware update pipeline and the
//! configuration record store, built on top of the HAL interfaces.
pub mod control;
pub mod eeprom;
pub mod firmware;
pub mod indicator;
pub mod protocol;
pub mod topology;
pub mod updater;
