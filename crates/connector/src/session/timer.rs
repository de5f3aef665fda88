//! Idle timer shared between a connector and its sessions.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::sync::lock;

/// Tracks the time of the last activity.
#[derive(Debug)]
pub struct IdleTimer {
    last_activity: Mutex<Instant>,
}

impl Default for IdleTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleTimer {
    pub fn new() -> Self {
        Self {
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Record activity now.
    pub fn reset(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    /// Time since the last activity.
    pub fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    /// Whether more than `timeout` has passed without activity.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }
}
