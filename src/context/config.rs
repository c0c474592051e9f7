use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;

use crate::serializer::{Serializer, default_serializer};

/// A configuration value that would leave a session unable to run.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
}

fn non_zero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ZeroDuration { field });
    }
    Ok(())
}

/// Configuration for a [`ServerContext`](super::ServerContext).
#[derive(Debug, Clone, Builder)]
pub struct ServerConfig {
    /// Address to listen on. Port `0` binds an ephemeral port.
    pub endpoint: SocketAddr,

    /// Interval of the liveness sweep, and how long a peer may go without a ping or poll before
    /// it is evicted.
    #[builder(default = Duration::from_secs(30))]
    pub ping_timeout: Duration,

    /// Longest a poll request is held open while the peer has nothing queued.
    #[builder(default = Duration::from_secs(10))]
    pub poll_timeout: Duration,

    /// Grace period for in-flight calls when the transport stops.
    #[builder(default = Duration::from_secs(5))]
    pub shutdown_timeout: Duration,

    #[builder(default = default_serializer())]
    pub serializer: Arc<dyn Serializer>,
}

impl ServerConfig {
    /// Reject durations that would make the liveness sweep or the poll loop spin.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("ping_timeout", self.ping_timeout)?;
        non_zero("poll_timeout", self.poll_timeout)
    }
}

/// Configuration for a [`ClientContext`](super::ClientContext).
#[derive(Debug, Clone, Builder)]
pub struct ClientConfig {
    /// Server address to connect to.
    pub endpoint: SocketAddr,

    #[builder(default = Duration::from_secs(15))]
    pub ping_interval: Duration,

    /// Bound on each poll round-trip and on setting up the poll call. Must exceed the server's
    /// poll timeout.
    #[builder(default = Duration::from_secs(30))]
    pub receive_timeout: Duration,

    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,

    #[builder(default = default_serializer())]
    pub serializer: Arc<dyn Serializer>,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("ping_interval", self.ping_interval)?;
        non_zero("receive_timeout", self.receive_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let endpoint: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let server = ServerConfig::builder().endpoint(endpoint).build();
        assert_eq!(server.ping_timeout, Duration::from_secs(30));
        assert_eq!(server.poll_timeout, Duration::from_secs(10));

        let client = ClientConfig::builder()
            .endpoint(endpoint)
            .ping_interval(Duration::from_secs(1))
            .build();
        assert_eq!(client.ping_interval, Duration::from_secs(1));
        assert_eq!(client.receive_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        let endpoint: SocketAddr = "127.0.0.1:0".parse().unwrap();

        assert!(ServerConfig::builder().endpoint(endpoint).build().validate().is_ok());
        let server = ServerConfig::builder()
            .endpoint(endpoint)
            .ping_timeout(Duration::ZERO)
            .build();
        assert!(matches!(
            server.validate(),
            Err(ConfigError::ZeroDuration { field: "ping_timeout" })
        ));

        assert!(ClientConfig::builder().endpoint(endpoint).build().validate().is_ok());
        let client = ClientConfig::builder()
            .endpoint(endpoint)
            .ping_interval(Duration::ZERO)
            .build();
        assert!(matches!(
            client.validate(),
            Err(ConfigError::ZeroDuration { field: "ping_interval" })
        ));
    }
}
