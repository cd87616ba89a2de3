//! Interfaces to the operating system services the engines lean on:
//! restarting the device, tearing down competing processes and
//! reading platform identification.

/// Requests an immediate, non-cancelable device restart.
pub trait Restart: Send + Sync {
    fn restart(&self);
}

/// Process table access.
pub trait Processes: Send + Sync {
    /// Terminates every process whose name starts with `prefix`,
    /// returning how many were signalled.
    fn terminate_matching(&self, prefix: &str) -> usize;
}

pub trait Platform: Send + Sync {
    /// Total system memory, in KiB.
    fn memory_kb(&self) -> u64;
    /// Device serial number, all zeroes when unknown.
    fn serial_number(&self) -> [u8; 8];
}
