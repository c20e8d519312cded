use std::time::Duration;

/// Tunables for one transport instance
///
/// The defaults are the deployment constants; tests shrink the waits to keep the address
/// handshake fast against an in-process master.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// 6-byte factory identifier sent in address requests
    pub chip_id: [u8; 6],

    /// Most packets the inbound queue will hold
    pub inbound_max_packets: usize,
    /// Most aggregate payload bytes the inbound queue will hold
    pub inbound_max_bytes: usize,

    /// Upper bound on the random delay before each address request, so simultaneously
    /// re-addressing nodes don't collide
    pub request_jitter: Duration,
    /// How long to wait for a matching address response before retransmitting the request
    pub response_window: Duration,
    /// Receive slice while waiting inside the response window
    pub response_slice: Duration,
    /// Pause after the controller refuses to transmit an address request
    pub transmit_backoff: Duration,
    /// Pause after the master rejects an address request
    pub rejection_backoff: Duration,

    /// Daemon receive timeout while a segmented send is in flight
    pub busy_recv_timeout: Duration,
    /// Daemon receive timeout otherwise
    pub idle_recv_timeout: Duration,
    /// Pause after the controller reports a receive fault
    pub fault_backoff: Duration,

    /// How often `poll_write` re-checks the outbound slot
    pub write_poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chip_id: [0u8; 6],
            inbound_max_packets: 32,
            inbound_max_bytes: 16 * 1024,
            request_jitter: Duration::from_millis(250),
            response_window: Duration::from_secs(3),
            response_slice: Duration::from_secs(1),
            transmit_backoff: Duration::from_secs(10),
            rejection_backoff: Duration::from_secs(30),
            busy_recv_timeout: Duration::from_millis(5),
            idle_recv_timeout: Duration::from_millis(50),
            fault_backoff: Duration::from_secs(10),
            write_poll_interval: Duration::from_millis(10),
        }
    }
}

impl TransportConfig {
    /// Default tunables for the node with the given factory identifier
    pub fn for_chip(chip_id: [u8; 6]) -> Self {
        Self {
            chip_id,
            ..Self::default()
        }
    }
}
