//! Single-slot handoff between the radio driver's context and the main loop.
//!
//! Capacity is one. The producer never blocks: when the slot is occupied the new
//! value is handed back and the caller drops it. Only one frame is ever in
//! flight per link, so delivery order is preserved and excess traffic is lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    occupied: AtomicBool,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            occupied: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        // A panic while holding the slot cannot leave it half-written; keep going.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Put `value` in the slot, or return it if the slot is full.
    pub fn offer(&self, value: T) -> Result<(), T> {
        if self.occupied.load(Ordering::Acquire) {
            return Err(value);
        }
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(value);
        }
        *slot = Some(value);
        self.occupied.store(true, Ordering::Release);
        Ok(())
    }

    pub fn take(&self) -> Option<T> {
        if !self.occupied.load(Ordering::Acquire) {
            return None;
        }
        let mut slot = self.lock();
        let value = slot.take();
        self.occupied.store(false, Ordering::Release);
        value
    }
}
