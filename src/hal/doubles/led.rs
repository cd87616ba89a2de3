use crate::hal::led::Toggle;
use std::sync::{Arc, Mutex, PoisonError};

/// LED that records every state it is driven into.
#[derive(Clone, Default)]
pub struct MockLed {
    states: Arc<Mutex<Vec<bool>>>,
}

impl MockLed {
    pub fn states(&self) -> Vec<bool> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_on(&self) -> bool { self.states().last().copied().unwrap_or(false) }

    fn push(&self, state: bool) {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).push(state);
    }
}

impl Toggle for MockLed {
    fn on(&mut self) { self.push(true) }
    fn off(&mut self) { self.push(false) }
    fn toggle(&mut self) {
        let next = !self.is_on();
        self.push(next)
    }
}
