//! Time source for the blocking waits inside the engines.

use std::time::Instant;

/// Monotonic milliseconds plus a yield hook.
///
/// `yield_now` is called inside every busy-wait so the driver's completion
/// events can land; nothing else in the application runs meanwhile.
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn yield_now(&self);
}

/// Wall-clock time since construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn yield_now(&self) {
        (**self).yield_now()
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn yield_now(&self) {
        (**self).yield_now()
    }
}
