//! Adaptive backoff between conflicted attempts
//!
//! Early retries busy-spin (the window that caused the conflict is usually a
//! few instructions wide); persistent contention escalates to yielding the
//! thread, or the task in the async variant.

use std::hint;
use std::thread;

const SPIN_LIMIT: u32 = 6;
const STEP_LIMIT: u32 = 10;

pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff { step: 0 }
    }

    fn spin(&self) {
        for _ in 0..(1u32 << self.step) {
            hint::spin_loop();
        }
    }

    fn bump(&mut self) {
        if self.step < STEP_LIMIT {
            self.step += 1;
        }
    }

    /// Wait before the next synchronous attempt.
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            self.spin();
        } else {
            thread::yield_now();
        }
        self.bump();
    }

    /// Wait before the next asynchronous attempt without blocking the
    /// executor thread.
    pub async fn snooze_async(&mut self) {
        if self.step <= SPIN_LIMIT {
            self.spin();
        } else {
            tokio::task::yield_now().await;
        }
        self.bump();
    }
}
