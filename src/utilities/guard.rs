//! RAII guard that calls a given function when constructed,
//! and another when it drops out of scope.
//!
//! Useful for ensuring resource cleanup no matter the return
//! path. Flash regions use it to bracket the device lock hooks
//! around every erase/program pair.
//!
//! Example
//! ```
//! # use aurga_fw_lib::utilities::guard::*;
//! let mut events = Vec::new();
//! {
//!     let mut guard = Guard::new(&mut events, |e| e.push("lock"), |e| e.push("unlock"));
//!     guard.push("erase");
//! }
//! // Guard has dropped out of scope here, so the exit hook ran
//! assert_eq!(events, ["lock", "erase", "unlock"]);
//! ```

use core::ops::{Deref, DerefMut};

pub struct Guard<'a, T, G>
where
    G: FnOnce(&mut T),
{
    item: &'a mut T,
    on_exit: Option<G>,
}

impl<'a, T, G> Guard<'a, T, G>
where
    G: FnOnce(&mut T),
{
    pub fn new<F: FnOnce(&mut T)>(item: &'a mut T, on_entry: F, on_exit: G) -> Self {
        on_entry(item);
        Self { item, on_exit: Some(on_exit) }
    }
}

impl<'a, T, G> Deref for Guard<'a, T, G>
where
    G: FnOnce(&mut T),
{
    type Target = T;
    fn deref(&self) -> &T { self.item }
}

impl<'a, T, G> DerefMut for Guard<'a, T, G>
where
    G: FnOnce(&mut T),
{
    fn deref_mut(&mut self) -> &mut T { self.item }
}

impl<'a, T, G> Drop for Guard<'a, T, G>
where
    G: FnOnce(&mut T),
{
    fn drop(&mut self) {
        if let Some(on_exit) = self.on_exit.take() {
            on_exit(self.item);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_hook_runs_on_early_return() {
        fn attempt(log: &mut Vec<&'static str>, fail: bool) -> Result<(), ()> {
            let mut guard = Guard::new(log, |l| l.push("enter"), |l| l.push("exit"));
            guard.push("work");
            if fail {
                return Err(());
            }
            guard.push("done");
            Ok(())
        }

        let mut log = Vec::new();
        assert!(attempt(&mut log, true).is_err());
        assert_eq!(log, ["enter", "work", "exit"]);

        let mut log = Vec::new();
        assert!(attempt(&mut log, false).is_ok());
        assert_eq!(log, ["enter", "work", "done", "exit"]);
    }
}
