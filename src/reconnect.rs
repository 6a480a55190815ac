use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

/// Fixed-delay, fixed-cap reconnect bookkeeping.
///
/// The counter only goes back to zero through [`ReconnectPolicy::reset`], which the live
/// channel calls after a successful connection. An explicit reconnect request does not reset it.
#[derive(Debug)]
pub struct ReconnectPolicy {
    attempts: AtomicU32,
    max_attempts: u32,
    delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: AtomicU32::new(0),
            max_attempts,
            delay,
        }
    }

    pub fn next(&self) -> RetryDecision {
        loop {
            let current = self.attempts.load(Ordering::SeqCst);

            if current >= self.max_attempts {
                return RetryDecision::GiveUp { attempts: current };
            }

            match self.attempts.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return RetryDecision::Retry {
                        attempt: current + 1,
                        delay: self.delay,
                    }
                }
                Err(_) => continue,
            }
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(3000))
    }
}
