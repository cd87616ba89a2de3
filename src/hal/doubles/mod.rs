//! Test doubles for the hardware abstraction layer.
pub mod flash;
pub mod led;
pub mod system;
