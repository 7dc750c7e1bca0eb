//! TCP liveness probe for the task's external dependency.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::session::LivenessProbe;

/// Alive when a TCP connection to `address` succeeds within `timeout`.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    /// Probe `address` (`host:port`) with a 2s connect timeout.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Duration::from_secs(2),
        }
    }

    /// Override the connect timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probed address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl LivenessProbe for TcpProbe {
    fn is_alive(&self) -> bool {
        let addrs = match self.address.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::debug!(address = %self.address, error = %e, "cannot resolve probe address");
                return false;
            }
        };
        for addr in addrs {
            if TcpStream::connect_timeout(&addr, self.timeout).is_ok() {
                return true;
            }
        }
        false
    }
}
