//! Bit-flag event group used for command and status signalling between workers.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A shared set of 32 flag bits with blocking waits.
///
/// Workers poll it with [`get`](Self::get) at their suspension points and park on
/// [`wait_any`](Self::wait_any) when idle.
#[derive(Default)]
pub struct EventGroup {
    bits: Mutex<u32>,
    cv: Condvar,
}

impl EventGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u32 {
        *self.bits.lock().unwrap()
    }

    pub fn set(&self, bits: u32) {
        *self.bits.lock().unwrap() |= bits;
        self.cv.notify_all();
    }

    pub fn clear(&self, bits: u32) {
        *self.bits.lock().unwrap() &= !bits;
        self.cv.notify_all();
    }

    /// Set `bits` unless any of `guard` is set, in one step. Returns whether they were set.
    pub fn set_unless(&self, bits: u32, guard: u32) -> bool {
        let mut g = self.bits.lock().unwrap();
        if *g & guard != 0 {
            return false;
        }
        *g |= bits;
        drop(g);
        self.cv.notify_all();
        true
    }

    /// Block until any of `bits` is set, or until `timeout` expires (`None` waits forever).
    ///
    /// Returns the full bit set observed on wake-up; nothing is cleared.
    pub fn wait_any(&self, bits: u32, timeout: Option<Duration>) -> u32 {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut g = self.bits.lock().unwrap();
        while *g & bits == 0 {
            match deadline {
                None => g = self.cv.wait(g).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (ng, _timeout) = self.cv.wait_timeout(g, deadline - now).unwrap();
                    g = ng;
                }
            }
        }
        *g
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_clear_get() {
        let ev = EventGroup::new();
        ev.set(0b101);
        ev.clear(0b001);
        assert_eq!(ev.get(), 0b100);
    }

    #[test]
    fn wait_any_wakes_on_set() {
        let ev = Arc::new(EventGroup::new());
        let ev_set = ev.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            ev_set.set(1 << 4);
        });
        let bits = ev.wait_any((1 << 4) | (1 << 5), None);
        assert_eq!(bits & (1 << 4), 1 << 4);
        handle.join().unwrap();
    }

    #[test]
    fn set_unless_respects_guard() {
        let ev = EventGroup::new();
        assert!(ev.set_unless(0b01, 0b10));
        ev.set(0b100);
        assert!(!ev.set_unless(0b10, 0b100));
        assert_eq!(ev.get(), 0b101);
    }

    #[test]
    fn wait_any_times_out() {
        let ev = EventGroup::new();
        assert_eq!(ev.wait_any(1, Some(Duration::from_millis(5))), 0);
    }
}
