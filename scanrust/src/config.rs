//! Session and adapter configuration

use std::time::Duration;

use scanrust_core::constants;

/// Timeouts and buffering for a [`DeviceSession`](crate::DeviceSession)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bound on connect, identify and initialization
    pub open_timeout: Duration,
    /// Bound on each driver call (configure, start, single chunk read)
    pub command_timeout: Duration,
    /// Bytes requested per chunk read
    pub chunk_size: usize,
    /// Bound on cancel confirmation before falling back to a reset
    pub cancel_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open_timeout: constants::DEFAULT_OPEN_TIMEOUT,
            command_timeout: constants::DEFAULT_COMMAND_TIMEOUT,
            chunk_size: constants::DEFAULT_CHUNK_SIZE,
            cancel_timeout: constants::DEFAULT_CANCEL_TIMEOUT,
        }
    }
}

impl SessionConfig {
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set chunk size (at least one byte)
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }
}

/// Timeouts for a [`ProtocolAdapter`](crate::hardware::ProtocolAdapter)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Wait for each response frame
    pub response_timeout: Duration,
    /// Bound on the wait-for-ready poll
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            response_timeout: constants::DEFAULT_RESPONSE_TIMEOUT,
            ready_timeout: constants::DEFAULT_READY_TIMEOUT,
            ready_poll_interval: constants::DEFAULT_READY_POLL_INTERVAL,
        }
    }
}

impl AdapterConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_ready_poll_interval(mut self, interval: Duration) -> Self {
        self.ready_poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_come_from_constants() {
        let config = SessionConfig::default();
        assert_eq!(config.chunk_size, constants::DEFAULT_CHUNK_SIZE);
        assert_eq!(config.cancel_timeout, constants::DEFAULT_CANCEL_TIMEOUT);
    }

    #[test]
    fn test_chunk_size_never_zero() {
        assert_eq!(SessionConfig::default().with_chunk_size(0).chunk_size, 1);
    }
}
