//! Hardware Abstraction Layer, containing interfaces
//! for the flash media and the side I/O the engines drive.

pub mod flash;
pub mod led;
pub mod system;

#[cfg(not(target_arch = "arm"))]
#[doc(hidden)]
pub mod doubles;
