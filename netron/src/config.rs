//! Configuration structures for peer behavior.

use std::time::Duration;

/// Configuration for a peer session.
///
/// Supplied when the peer is created and never changed afterwards.
#[derive(Clone, Debug)]
pub struct PeerOptions {
    /// Protocol name announced by transports that need one.
    pub protocol: String,

    /// Initial delay between connection attempts
    pub retry_timeout: Duration,

    /// Maximum delay between connection attempts
    pub retry_max_timeout: Duration,

    /// Number of connection attempts before giving up
    pub reconnects: u32,

    /// Timeout for a single connection attempt
    pub connect_timeout: Duration,

    /// How long a request waits for its reply before failing with
    /// `RequestTimeout`.
    pub response_timeout: Duration,

    /// Default number of buffered stream packets before the reader asks the
    /// writer to pause.
    pub high_water_mark: usize,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            protocol: "netron".to_string(),
            retry_timeout: Duration::from_millis(300),
            retry_max_timeout: Duration::from_secs(3),
            reconnects: 3,
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(180),
            high_water_mark: 16,
        }
    }
}

impl PeerOptions {
    /// Create a configuration with the given response timeout and default
    /// retry parameters.
    pub fn new(response_timeout: Duration) -> Self {
        Self {
            response_timeout,
            ..Self::default()
        }
    }

    /// Override the response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Override the retry policy used while connecting.
    pub fn with_retry(mut self, initial: Duration, max: Duration, reconnects: u32) -> Self {
        self.retry_timeout = initial;
        self.retry_max_timeout = max;
        self.reconnects = reconnects;
        self
    }

    /// Override the default stream high water mark.
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark.max(1);
        self
    }

    /// Create a configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self {
            retry_timeout: Duration::from_millis(10),
            retry_max_timeout: Duration::from_millis(500),
            reconnects: 10,
            connect_timeout: Duration::from_millis(500),
            response_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Create a configuration for high-latency WAN networking.
    pub fn wan_network() -> Self {
        Self {
            retry_timeout: Duration::from_millis(500),
            retry_max_timeout: Duration::from_secs(60),
            reconnects: 10,
            connect_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(300),
            high_water_mark: 64,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = PeerOptions::default();
        assert_eq!(options.response_timeout, Duration::from_secs(180));
        assert_eq!(options.reconnects, 3);
        assert_eq!(options.retry_timeout, Duration::from_millis(300));
        assert_eq!(options.retry_max_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_builders() {
        let options = PeerOptions::new(Duration::from_millis(500))
            .with_retry(Duration::from_millis(1), Duration::from_millis(8), 5)
            .with_high_water_mark(0);

        assert_eq!(options.response_timeout, Duration::from_millis(500));
        assert_eq!(options.reconnects, 5);
        assert_eq!(options.high_water_mark, 1);
    }
}
