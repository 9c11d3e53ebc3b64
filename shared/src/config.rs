//! Timeouts and limits shared by the client and the server.

use std::time::Duration;

/// Tunables for connections, the reliable channel and snapshot history.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// How long `connect()` waits for the server's accept
    pub connect_timeout: Duration,
    /// How long a graceful disconnect waits for the peer's confirmation
    pub disconnect_timeout: Duration,
    /// Upper bound on one receive-loop wait, so shutdown requests are noticed promptly
    pub service_timeout: Duration,
    /// Delay before an unacknowledged reliable frame is sent again
    pub resend_interval: Duration,
    /// Resends of a single reliable frame before the connection counts as lost
    pub max_retransmits: u32,
    /// Silence from the peer after which the connection counts as lost
    pub peer_timeout: Duration,
    /// Idle time after which a keep-alive ping is sent
    pub keepalive_interval: Duration,
    /// How long the pieces of an unreliable fragmented payload wait for the rest
    pub fragment_timeout: Duration,
    /// Snapshots retained for diffing (server) or as diff bases (client)
    pub snapshot_history: usize,
    /// Connections accepted before new ones are refused
    pub max_peers: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(3),
            service_timeout: Duration::from_millis(10),
            resend_interval: Duration::from_millis(100),
            max_retransmits: 50,
            peer_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(1),
            fragment_timeout: Duration::from_secs(1),
            snapshot_history: 32,
            max_peers: 32,
        }
    }
}

impl NetConfig {
    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }
}
