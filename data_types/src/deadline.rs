use std::time::{Duration, Instant};

/// An absolute deadline plus the timeout it was derived from.
///
/// The timeout is retained only so error messages can say which limit was
/// exceeded. Deadlines propagate by value through every RPC; nothing
/// extends them.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    deadline: Instant,
    timeout: Duration,
}

impl Deadline {
    /// Returns a deadline `timeout` from now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    /// The absolute instant after which work must stop.
    pub fn instant(&self) -> Instant {
        self.deadline
    }

    /// The timeout this deadline was created with.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns true once the deadline has passed.
    pub fn exceeded(&self) -> bool {
        Instant::now() >= self.deadline
    }
}
