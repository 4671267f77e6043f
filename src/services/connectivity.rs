use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tracing::debug;

#[async_trait]
pub trait ConnectivityMonitor: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Treats a successful DNS lookup of a well-known host as "online".
#[derive(Debug, Clone)]
pub struct DnsConnectivity {
    probe: String,
    timeout: Duration,
}

impl Default for DnsConnectivity {
    fn default() -> Self {
        Self::new("google.com:443", Duration::from_secs(3))
    }
}

impl DnsConnectivity {
    pub fn new(probe: impl Into<String>, timeout: Duration) -> Self {
        Self {
            probe: probe.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ConnectivityMonitor for DnsConnectivity {
    async fn is_online(&self) -> bool {
        match tokio::time::timeout(self.timeout, lookup_host(self.probe.as_str())).await {
            Ok(Ok(mut addresses)) => addresses.next().is_some(),
            Ok(Err(error)) => {
                debug!("connectivity probe {} failed: {}", self.probe, error);
                false
            }
            Err(_) => {
                debug!("connectivity probe {} timed out", self.probe);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ConnectivityMonitor, DnsConnectivity};

    #[tokio::test]
    async fn literal_address_resolves_offline() {
        let monitor = DnsConnectivity::new("127.0.0.1:443", Duration::from_secs(1));
        assert!(monitor.is_online().await);
    }
}
