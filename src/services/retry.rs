use std::time::Duration;

/// Something that can wait. Real runs sleep the thread; tests record the
/// requested delays instead.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never less than 1.
    pub attempts: u32,
    /// Fixed wait between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
    pub accepted: bool,
}

impl<T> RetryOutcome<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Run `op` until `accept` approves its result or the policy runs out.
///
/// `op` receives the 1-based attempt number. The last result is returned
/// either way; `accepted` tells the two cases apart.
pub fn retry_until<T>(
    policy: RetryPolicy,
    sleeper: &dyn Sleeper,
    mut op: impl FnMut(u32) -> T,
    accept: impl Fn(&T) -> bool,
) -> RetryOutcome<T> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let value = op(attempt);
        if accept(&value) {
            return RetryOutcome {
                value,
                attempts: attempt,
                accepted: true,
            };
        }
        if attempt >= attempts {
            return RetryOutcome {
                value,
                attempts: attempt,
                accepted: false,
            };
        }
        sleeper.sleep(policy.delay);
        attempt += 1;
    }
}
