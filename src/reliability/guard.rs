use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

/// Serializes gate operations and refuses nesting.
///
/// Callers on other threads wait their turn. Only a thread that re-enters
/// while it already holds the latch is turned away.
#[derive(Debug, Default)]
pub struct EntryLatch {
    serial: Mutex<()>,
    owner: Mutex<Option<ThreadId>>,
}

impl EntryLatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn owner(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.owner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// `None` when the calling thread is already inside.
    pub fn try_enter(&self) -> Option<EntryGuard<'_>> {
        let me = thread::current().id();
        if *self.owner() == Some(me) {
            return None;
        }
        let serial = self.serial.lock().unwrap_or_else(|p| p.into_inner());
        *self.owner() = Some(me);
        Some(EntryGuard {
            latch: self,
            _serial: serial,
        })
    }
}

/// Held for the duration of one gate operation.
pub struct EntryGuard<'a> {
    latch: &'a EntryLatch,
    // released after `drop` clears the owner
    _serial: MutexGuard<'a, ()>,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        *self.latch.owner() = None;
    }
}
