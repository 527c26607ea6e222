//! Message size limits.

/// Default limit for a single message, 4 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Upper bounds on encoded message sizes.
///
/// Exceeding a limit fails the call with `RESOURCE_EXHAUSTED`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageLimits {
    max_send: Option<usize>,
    max_receive: Option<usize>,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_send: None,
            max_receive: Some(DEFAULT_MAX_MESSAGE_SIZE),
        }
    }
}

impl MessageLimits {
    pub fn unlimited() -> Self {
        Self {
            max_send: None,
            max_receive: None,
        }
    }

    pub fn max_send(mut self, bytes: usize) -> Self {
        self.max_send = Some(bytes);
        self
    }

    pub fn max_receive(mut self, bytes: usize) -> Self {
        self.max_receive = Some(bytes);
        self
    }

    /// Limit applied when reading bodies; `usize::MAX` when unlimited.
    pub fn receive_limit(&self) -> usize {
        self.max_receive.unwrap_or(usize::MAX)
    }

    pub fn check_send(&self, size: usize) -> Result<(), String> {
        check(self.max_send, size, "sent")
    }

    pub fn check_receive(&self, size: usize) -> Result<(), String> {
        check(self.max_receive, size, "received")
    }
}

fn check(limit: Option<usize>, size: usize, direction: &str) -> Result<(), String> {
    match limit {
        Some(max) if size > max => Err(format!(
            "{direction} message of {size} bytes exceeds the limit of {max} bytes"
        )),
        _ => Ok(()),
    }
}
