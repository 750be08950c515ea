/// Configuration shared by the transport implementations.
///
/// ```rust
/// use peerlog_transport::TransportConfig;
///
/// let config = TransportConfig::new()
///     .max_message_size(64 * 1024)
///     .recv_buffer(32);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest single message a channel will send or accept.
    pub(crate) max_message_size: usize,
    /// Capacity of each relay mailbox subscription.
    pub(crate) recv_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a config with defaults.
    ///
    /// `PEERLOG_MAX_MESSAGE_SIZE`, when set to a positive integer, replaces
    /// the 1 MiB default message size.
    pub fn new() -> Self {
        let max_message_size = std::env::var("PEERLOG_MAX_MESSAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|size: &usize| *size > 0)
            .unwrap_or(1024 * 1024);

        Self {
            max_message_size,
            recv_buffer: 256,
        }
    }

    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn recv_buffer(mut self, capacity: usize) -> Self {
        self.recv_buffer = capacity;
        self
    }

    pub fn get_max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn get_recv_buffer(&self) -> usize {
        self.recv_buffer
    }

    /// Reject settings the channels cannot run with.
    pub fn validate(&self) -> Result<(), crate::TransportError> {
        if self.max_message_size == 0 {
            return Err(crate::TransportError::Config(
                "max_message_size must be positive".into(),
            ));
        }
        if self.recv_buffer == 0 {
            return Err(crate::TransportError::Config(
                "recv_buffer must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = TransportConfig::new().max_message_size(10).recv_buffer(2);
        assert_eq!(config.get_max_message_size(), 10);
        assert_eq!(config.get_recv_buffer(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(TransportConfig::new().recv_buffer(0).validate().is_err());
        assert!(TransportConfig::new().max_message_size(0).validate().is_err());
    }
}
