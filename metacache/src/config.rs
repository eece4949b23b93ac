//! Connection configuration.

/// Configuration for a single server connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server hostname or address.
    pub host: String,
    /// Server port (memcached default is 11211).
    pub port: u16,
    /// Optional identifier attached to this connection's log events.
    pub id: Option<u64>,
}

impl ConnectionConfig {
    /// Create a configuration for `host:port` with no id.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            id: None,
        }
    }

    /// Attach an identifier used in log events.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }
}
