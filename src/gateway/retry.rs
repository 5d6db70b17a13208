/// Whether a failed attempt may move on to another channel.
///
/// Pinned requests never retry. Rate limits and server errors do; a 400 means the request itself is
/// wrong and a 2xx failure came from reading the body, so neither is worth another channel.
pub fn should_retry(status: u16, pinned: bool) -> bool {
    if pinned {
        return false;
    }
    match status {
        429 => true,
        500..=599 => true,
        400 => false,
        200..=299 => false,
        _ => true,
    }
}

/// Attempts left for one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryBudget {
    remaining: u32,
}

impl RetryBudget {
    pub fn new(retries: u32) -> Self {
        Self { remaining: retries }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Takes one retry if any is left.
    pub fn take(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}
