// Socket plumbing shared by the event gateway.

use socket2::{Domain, Protocol, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

/// Read timeout on monitor sockets; bounds how long a consumer thread can
/// stay blocked after its stop flag is raised.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(500);

// common setup for all our UDP sockets
fn new_socket() -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    Ok(socket)
}

/// On Windows it is improper to bind to the multicast address itself;
/// bind to INADDR_ANY at the same port instead.
#[cfg(windows)]
fn bind_to_multicast(socket: &socket2::Socket, addr: &SocketAddrV4) -> io::Result<()> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), addr.port());
    socket.bind(&socket2::SockAddr::from(addr))?;
    Ok(())
}

/// On unixes we bind to the multicast address, which causes multicast
/// packets destined for other groups to be filtered by the kernel.
#[cfg(unix)]
fn bind_to_multicast(socket: &socket2::Socket, addr: &SocketAddrV4) -> io::Result<()> {
    let addr = SocketAddr::new(IpAddr::V4(*addr.ip()), addr.port());
    socket.bind(&socket2::SockAddr::from(addr))?;
    Ok(())
}

/// Create a UDP socket joined to `addr`'s group, bound and ready for both
/// sending and receiving. Reads time out so that consumer threads never
/// hang waiting for packets.
pub fn create_multicast(addr: &SocketAddrV4, nic_addr: &Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = new_socket()?;

    socket.join_multicast_v4(addr.ip(), nic_addr)?;
    bind_to_multicast(&socket, addr)?;

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    Ok(socket)
}

/// Split a `"group:port"` option value into its parts.
pub fn parse_group(value: &str) -> Option<(Ipv4Addr, u16)> {
    let (group, port) = value.split_once(':')?;
    Some((group.parse().ok()?, port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::parse_group;
    use std::net::Ipv4Addr;

    #[test]
    fn group_option_parsing() {
        assert_eq!(
            parse_group("224.0.0.2:45702"),
            Some((Ipv4Addr::new(224, 0, 0, 2), 45702))
        );
        assert_eq!(parse_group("224.0.0.2"), None);
        assert_eq!(parse_group("not-an-ip:45702"), None);
        assert_eq!(parse_group("224.0.0.2:port"), None);
    }
}
