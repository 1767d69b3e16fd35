//! Cross-thread handoff between the radio driver's event-loop callback (or
//! the captive-portal HTTP server thread) and the single-threaded supervisor.
//!
//! Plays the role the original firmware gave a FreeRTOS `EventGroup`
//! (`WIFI_CONNECTED_BIT` / `WIFI_FAIL_BIT` / `PORTAL_DONE_BIT`, set from
//! `xEventGroupSetBits` in an event handler and awaited with
//! `xEventGroupWaitBits`). `std::sync::Condvar` gives the same
//! set-before-wait-is-still-observed guarantee: the mask is checked under the
//! mutex before the waiter ever blocks on the condvar.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flag(pub u8);

pub const STA_CONNECTED: Flag = Flag(1 << 0);
pub const STA_FAILED: Flag = Flag(1 << 1);
pub const PORTAL_CREDENTIALS_RECEIVED: Flag = Flag(1 << 2);

pub struct EventFlags {
    state: Mutex<u8>,
    cond: Condvar,
}

impl EventFlags {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self, flag: Flag) {
        let mut bits = self.state.lock().unwrap();
        *bits |= flag.0;
        self.cond.notify_all();
    }

    pub fn clear(&self, flag: Flag) {
        let mut bits = self.state.lock().unwrap();
        *bits &= !flag.0;
    }

    /// Block until any bit in `mask` is set, or `timeout` elapses. Returns
    /// the bits that were observed set (a subset of `mask`, possibly empty on
    /// timeout). Clears the observed bits before returning, matching the
    /// original `pdTRUE` "clear on exit" FreeRTOS call convention.
    pub fn wait(&self, mask: u8, timeout: Duration) -> u8 {
        let bits = self.state.lock().unwrap();
        let (mut bits, _timed_out) = self
            .cond
            .wait_timeout_while(bits, timeout, |b| *b & mask == 0)
            .unwrap();

        let observed = *bits & mask;
        *bits &= !observed;
        observed
    }
}

impl Default for EventFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_before_wait_is_still_observed() {
        let flags = EventFlags::new();
        flags.set(STA_CONNECTED);
        let observed = flags.wait(STA_CONNECTED.0 | STA_FAILED.0, Duration::from_millis(50));
        assert_eq!(observed, STA_CONNECTED.0);
    }

    #[test]
    fn wait_times_out_when_nothing_set() {
        let flags = EventFlags::new();
        let observed = flags.wait(STA_CONNECTED.0, Duration::from_millis(20));
        assert_eq!(observed, 0);
    }

    #[test]
    fn wait_wakes_on_concurrent_set() {
        let flags = Arc::new(EventFlags::new());
        let setter = flags.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            setter.set(PORTAL_CREDENTIALS_RECEIVED);
        });
        let observed = flags.wait(PORTAL_CREDENTIALS_RECEIVED.0, Duration::from_secs(2));
        handle.join().unwrap();
        assert_eq!(observed, PORTAL_CREDENTIALS_RECEIVED.0);
    }
}
