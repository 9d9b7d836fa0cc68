//! Module for time measurement and waiting.

use std::{
    thread,
    time::{Duration, Instant},
};

pub struct OsalTimer {
    stop_time: Instant,
}

impl OsalTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            stop_time: Instant::now() + timeout,
        }
    }

    pub fn restart(&mut self, timeout: Duration) {
        *self = Self::new(timeout);
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.stop_time
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self) -> Duration {
        self.stop_time.saturating_duration_since(Instant::now())
    }
}

/// Sleep for the given number of microseconds
pub fn usleep(micros: u64) {
    thread::sleep(Duration::from_micros(micros));
}
