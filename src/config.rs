use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Cap on a reassembled message. A frame that would push the current
    /// message past this closes the session with 1009 MESSAGE_TOO_LONG.
    pub max_message_size: usize,
    /// Deadline for reads that need a fixed byte count (handshake head,
    /// frame headers, control payloads) and for blocking flushes. Hitting
    /// it mid-frame closes the session with 1008 POLICY_VIOLATION.
    pub io_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_message_size: 64 << 20,
            io_timeout: Duration::from_secs(5),
        }
    }
}
