//! Local address discovery.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tracing::{debug, warn};

/// Public resolver used only to pick an outbound interface; nothing is sent.
const PROBE_TARGET: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80);

/// Returned when no outbound interface can be determined.
pub const FALLBACK_ADDRESS: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Address of the interface the OS would route outbound traffic through.
///
/// Connecting a UDP socket only selects a route, so this works without
/// network access as long as a default route exists.
pub fn discover_local_ip() -> Ipv4Addr {
    match probe(PROBE_TARGET) {
        Ok(ip) => {
            debug!(address = %ip, "discovered local address");
            ip
        }
        Err(e) => {
            warn!(error = %e, fallback = %FALLBACK_ADDRESS, "cannot discover local address");
            FALLBACK_ADDRESS
        }
    }
}

fn probe(target: SocketAddr) -> std::io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
    socket.connect(target)?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("unusable local address {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_loopback() {
        let ip = probe("127.0.0.1:9".parse().unwrap()).unwrap();
        assert!(ip.is_loopback());
    }

    #[test]
    fn test_discover_never_unspecified() {
        assert!(!discover_local_ip().is_unspecified());
    }
}
