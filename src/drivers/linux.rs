//! Linux system services: sysrq restart, procfs process control,
//! meminfo and sysfs GPIO LEDs.
use crate::hal::{
    led::Toggle,
    system::{Platform, Processes, Restart},
};
use log::{error, info, warn};
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

/// Restarts through the magic sysrq trigger.
pub struct SysRqRestart {
    trigger: PathBuf,
}

impl SysRqRestart {
    pub fn new() -> Self { Self::at("/proc/sysrq-trigger") }
    pub fn at(trigger: impl Into<PathBuf>) -> Self { Self { trigger: trigger.into() } }
}

impl Default for SysRqRestart {
    fn default() -> Self { Self::new() }
}

impl Restart for SysRqRestart {
    fn restart(&self) {
        info!("Restarting device");
        if let Err(e) = fs::write(&self.trigger, b"b") {
            error!("Restart through {:?} failed: {}", self.trigger, e);
        }
    }
}

pub struct ProcfsProcesses {
    root: PathBuf,
}

impl ProcfsProcesses {
    pub fn new() -> Self { Self::at("/proc") }
    pub fn at(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    /// Process ids whose command name starts with `prefix`, excluding
    /// this process.
    pub fn matching(&self, prefix: &str) -> Vec<u32> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot list {:?}: {}", self.root, e);
                return Vec::new();
            }
        };
        let own = std::process::id();
        let mut pids: Vec<u32> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| *pid != own)
            .filter(|pid| {
                fs::read_to_string(self.root.join(pid.to_string()).join("comm"))
                    .map(|name| name.trim_end().starts_with(prefix))
                    .unwrap_or(false)
            })
            .collect();
        pids.sort_unstable();
        pids
    }
}

impl Default for ProcfsProcesses {
    fn default() -> Self { Self::new() }
}

impl Processes for ProcfsProcesses {
    fn terminate_matching(&self, prefix: &str) -> usize {
        self.matching(prefix)
            .into_iter()
            .filter(|pid| {
                match Command::new("kill").arg("-TERM").arg(pid.to_string()).status() {
                    Ok(status) if status.success() => {
                        info!("Terminated process {}", pid);
                        true
                    }
                    Ok(status) => {
                        warn!("kill {} exited with {}", pid, status);
                        false
                    }
                    Err(e) => {
                        warn!("Cannot signal process {}: {}", pid, e);
                        false
                    }
                }
            })
            .count()
    }
}

pub struct LinuxPlatform {
    meminfo: PathBuf,
    serial: [u8; 8],
}

impl LinuxPlatform {
    pub fn new(serial: [u8; 8]) -> Self { Self::with_meminfo("/proc/meminfo", serial) }

    pub fn with_meminfo(meminfo: impl Into<PathBuf>, serial: [u8; 8]) -> Self {
        Self { meminfo: meminfo.into(), serial }
    }
}

fn mem_total(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

impl Platform for LinuxPlatform {
    fn memory_kb(&self) -> u64 {
        match fs::read_to_string(&self.meminfo).ok().as_deref().and_then(mem_total) {
            Some(kb) => kb,
            None => {
                warn!("Total memory unavailable from {:?}", self.meminfo);
                0
            }
        }
    }

    fn serial_number(&self) -> [u8; 8] { self.serial }
}

/// LED on a sysfs-exported GPIO line.
pub struct SysfsLed {
    value: PathBuf,
    lit: bool,
}

impl SysfsLed {
    /// Exports `pin` under `/sys/class/gpio` and configures it as an output.
    pub fn export(pin: u32) -> Self { Self::export_at(Path::new("/sys/class/gpio"), pin) }

    pub fn export_at(root: &Path, pin: u32) -> Self {
        let line = root.join(format!("gpio{}", pin));
        if !line.exists() {
            if let Err(e) = fs::write(root.join("export"), pin.to_string()) {
                warn!("Cannot export GPIO {}: {}", pin, e);
            }
        }
        if let Err(e) = fs::write(line.join("direction"), "out") {
            warn!("Cannot configure GPIO {} as output: {}", pin, e);
        }
        Self { value: line.join("value"), lit: false }
    }

    fn set(&mut self, lit: bool) {
        self.lit = lit;
        if let Err(e) = fs::write(&self.value, if lit { "1" } else { "0" }) {
            warn!("Cannot drive {:?}: {}", self.value, e);
        }
    }
}

impl Toggle for SysfsLed {
    fn on(&mut self) { self.set(true) }
    fn off(&mut self) { self.set(false) }
    fn toggle(&mut self) { self.set(!self.lit) }
}
