//! Stand-in system services for running against a flash image on a
//! development host, where restarting, killing processes or driving
//! GPIO would touch the wrong machine.
use crate::hal::{
    led::Toggle,
    system::{Processes, Restart},
};
use log::{info, warn};

#[derive(Default)]
pub struct LogOnlyRestart;

impl Restart for LogOnlyRestart {
    fn restart(&self) { warn!("Restart requested; not restarting a hosted image"); }
}

#[derive(Default)]
pub struct UntouchedProcesses;

impl Processes for UntouchedProcesses {
    fn terminate_matching(&self, prefix: &str) -> usize {
        info!("Leaving processes matching {:?} running", prefix);
        0
    }
}

/// LED that remembers its state and drives nothing.
#[derive(Default)]
pub struct DarkLed {
    lit: bool,
}

impl DarkLed {
    pub fn is_on(&self) -> bool { self.lit }
}

impl Toggle for DarkLed {
    fn on(&mut self) { self.lit = true }
    fn off(&mut self) { self.lit = false }
    fn toggle(&mut self) { self.lit = !self.lit }
}
