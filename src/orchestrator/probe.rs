use std::net::{IpAddr, Ipv4Addr, TcpListener};

/// Answers whether a local TCP port can be bound right now.
///
/// The answer is only a snapshot; callers re-probe after every remediation.
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// [`PortProbe`] that binds a throwaway listener on the configured address.
#[derive(Debug, Clone)]
pub struct LocalProbe {
    addr: IpAddr,
}

impl LocalProbe {
    /// Probe on `host` when it is a literal IP address, otherwise on the
    /// IPv4 loopback address (`localhost` and friends).
    pub fn for_host(host: &str) -> Self {
        let addr = host
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Self { addr }
    }
}

impl Default for LocalProbe {
    fn default() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl PortProbe for LocalProbe {
    fn is_free(&self, port: u16) -> bool {
        // The listener is dropped at the end of the statement, releasing the port.
        TcpListener::bind((self.addr, port)).is_ok()
    }
}
