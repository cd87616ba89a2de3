//! Two-LED "update in progress" pattern, driven from its own thread.
use crate::{error::Error, hal::led::Toggle};
use log::debug;
use std::{
    sync::{
        mpsc::{self, RecvTimeoutError, Sender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// `(red, green)` states, one per period.
pub const PATTERN: [(bool, bool); 3] = [(true, true), (false, false), (true, false)];

type Led = Box<dyn Toggle + Send>;

struct Leds {
    red: Led,
    green: Led,
}

impl Leds {
    fn show(&mut self, (red, green): (bool, bool)) {
        if red { self.red.on() } else { self.red.off() }
        if green { self.green.on() } else { self.green.off() }
    }
}

struct Blinker {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

pub struct StatusIndicator {
    leds: Arc<Mutex<Leds>>,
    period: Duration,
    blinker: Mutex<Option<Blinker>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> { mutex.lock().unwrap_or_else(PoisonError::into_inner) }

impl StatusIndicator {
    pub fn new<R, G>(red: R, green: G, period: Duration) -> Self
    where
        R: Toggle + Send + 'static,
        G: Toggle + Send + 'static,
    {
        Self {
            leds: Arc::new(Mutex::new(Leds { red: Box::new(red), green: Box::new(green) })),
            period,
            blinker: Mutex::new(None),
        }
    }

    /// Starts blinking. Does nothing if already running.
    pub fn start(&self) -> Result<(), Error> {
        let mut blinker = locked(&self.blinker);
        if blinker.is_some() {
            return Ok(());
        }
        let (stop, stopped) = mpsc::channel::<()>();
        let leds = Arc::clone(&self.leds);
        let period = self.period;
        let thread = thread::Builder::new()
            .name("status-indicator".into())
            .spawn(move || {
                for step in PATTERN.iter().cycle() {
                    locked(&leds).show(*step);
                    match stopped.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
            })
            .map_err(|_| Error::Configuration("Failed to spawn indicator thread"))?;
        debug!("Status indicator started");
        *blinker = Some(Blinker { stop, thread });
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(blinker) = locked(&self.blinker).take() {
            let _ = blinker.stop.send(());
            let _ = blinker.thread.join();
            debug!("Status indicator stopped");
        }
    }

    pub fn is_running(&self) -> bool { locked(&self.blinker).is_some() }
}

impl Drop for StatusIndicator {
    fn drop(&mut self) { self.stop() }
}
