//! Loopback port allocation for the backend process.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use super::SupervisorError;

/// Find a free port in `[range_start, range_end]` by binding and
/// immediately releasing a loopback listener.
///
/// The returned port is a lease, not a reservation: it is only
/// guaranteed free until the backend binds it, so it must be drawn
/// fresh for every launch attempt.
pub fn allocate(range_start: u16, range_end: u16) -> Result<u16, SupervisorError> {
    for port in range_start..=range_end {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                drop(listener);
                log::debug!("Allocated backend port {port}");
                return Ok(port);
            }
            Err(e) => {
                log::trace!("Port {port} unavailable: {e}");
            }
        }
    }

    Err(SupervisorError::NoPortAvailable {
        start: range_start,
        end: range_end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

    #[test]
    fn allocated_port_is_immediately_bindable() {
        let port = allocate(42300, 42399).expect("range should have a free port");
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        TcpListener::bind(addr).expect("allocated port must be bindable");
    }

    #[test]
    fn skips_occupied_ports() {
        // Occupy the first port of a two-port range, then allocate.
        let mut held = None;
        let mut chosen = None;
        for base in (42400..42500).step_by(2) {
            let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, base);
            if let Ok(listener) = TcpListener::bind(addr) {
                held = Some(listener);
                chosen = Some(base);
                break;
            }
        }
        let base = chosen.expect("no free pair in test range");
        let port = allocate(base, base + 1).expect("second port should be free");
        assert_eq!(port, base + 1);
        drop(held);
    }

    #[test]
    fn exhausted_range_reports_no_port_available() {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        let listener = TcpListener::bind(addr).expect("bind ephemeral");
        let port = listener.local_addr().expect("local addr").port();

        let err = allocate(port, port).expect_err("occupied range must fail");
        assert!(matches!(
            err,
            SupervisorError::NoPortAvailable { start, end } if start == port && end == port
        ));
    }
}
