use crate::hal::system::{Platform, Processes, Restart};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, PoisonError,
};

/// Counts restart requests instead of restarting.
#[derive(Clone, Default)]
pub struct FakeRestart {
    requests: Arc<AtomicUsize>,
}

impl FakeRestart {
    pub fn requests(&self) -> usize { self.requests.load(Ordering::SeqCst) }
}

impl Restart for FakeRestart {
    fn restart(&self) { self.requests.fetch_add(1, Ordering::SeqCst); }
}

/// Records termination requests and reports a fixed number of matches.
#[derive(Clone, Default)]
pub struct FakeProcesses {
    prefixes: Arc<Mutex<Vec<String>>>,
    matches: usize,
}

impl FakeProcesses {
    pub fn with_matches(matches: usize) -> Self { Self { matches, ..Default::default() } }

    pub fn prefixes(&self) -> Vec<String> {
        self.prefixes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Processes for FakeProcesses {
    fn terminate_matching(&self, prefix: &str) -> usize {
        self.prefixes.lock().unwrap_or_else(PoisonError::into_inner).push(prefix.to_owned());
        self.matches
    }
}

#[derive(Copy, Clone, Debug)]
pub struct FakePlatform {
    pub memory_kb: u64,
    pub serial: [u8; 8],
}

impl Default for FakePlatform {
    fn default() -> Self { Self { memory_kb: 120_000, serial: [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88] } }
}

impl Platform for FakePlatform {
    fn memory_kb(&self) -> u64 { self.memory_kb }
    fn serial_number(&self) -> [u8; 8] { self.serial }
}
