use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Address family of an [`Endpoint`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EndpointType {
    Undefined,
    IpV4,
    IpV6,
}

/// Protocol-agnostic network address: an IPv4 or IPv6 address plus port,
/// or the undefined sentinel.
///
/// Malformed textual addresses produce an undefined endpoint; operations
/// receiving one fail with `InvalidArgument`, which keeps address parsing
/// errors on the same reporting path as every other failure.
///
/// Comparison is bitwise. Rendering emits dotted-decimal IPv4 and
/// shortest-form lowercase IPv6.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Undefined,
    V4(SocketAddrV4),
    V6(SocketAddrV6),
}

impl Endpoint {
    /// Parses `address` as dotted-decimal IPv4 or colon-hex IPv6 (with
    /// `::` compression). Unparsable input yields an undefined endpoint.
    pub fn new(address: &str, port: u16) -> Endpoint {
        if let Ok(v4) = address.parse::<Ipv4Addr>() {
            return Endpoint::V4(SocketAddrV4::new(v4, port));
        }
        if let Ok(v6) = address.parse::<Ipv6Addr>() {
            return Endpoint::V6(SocketAddrV6::new(v6, port, 0, 0));
        }
        Endpoint::Undefined
    }

    pub fn undefined() -> Endpoint {
        Endpoint::Undefined
    }

    pub fn from_v4_bytes(bytes: [u8; 4], port: u16) -> Endpoint {
        Endpoint::V4(SocketAddrV4::new(Ipv4Addr::from(bytes), port))
    }

    pub fn from_v6_bytes(bytes: [u8; 16], port: u16) -> Endpoint {
        Endpoint::V6(SocketAddrV6::new(Ipv6Addr::from(bytes), port, 0, 0))
    }

    /// Builds an IPv4 endpoint from a host-order integer address, e.g.
    /// `0x7F000001` for `127.0.0.1`.
    pub fn from_v4_u32(address: u32, port: u16) -> Endpoint {
        Endpoint::V4(SocketAddrV4::new(Ipv4Addr::from(address), port))
    }

    pub fn endpoint_type(&self) -> EndpointType {
        match self {
            Endpoint::Undefined => EndpointType::Undefined,
            Endpoint::V4(_) => EndpointType::IpV4,
            Endpoint::V6(_) => EndpointType::IpV6,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Endpoint::Undefined => 0,
            Endpoint::V4(addr) => addr.port(),
            Endpoint::V6(addr) => addr.port(),
        }
    }

    /// Address rendered without the port; `"undefined"` for the sentinel.
    pub fn address_string(&self) -> String {
        match self {
            Endpoint::Undefined => "undefined".to_string(),
            Endpoint::V4(addr) => addr.ip().to_string(),
            Endpoint::V6(addr) => addr.ip().to_string(),
        }
    }

    pub(crate) fn to_socket_addr(self) -> Option<SocketAddr> {
        match self {
            Endpoint::Undefined => None,
            Endpoint::V4(addr) => Some(SocketAddr::V4(addr)),
            Endpoint::V6(addr) => Some(SocketAddr::V6(addr)),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Endpoint {
        match addr {
            SocketAddr::V4(v4) => Endpoint::V4(v4),
            SocketAddr::V6(v6) => Endpoint::V6(v6),
        }
    }
}

impl From<(&str, u16)> for Endpoint {
    fn from((address, port): (&str, u16)) -> Endpoint {
        Endpoint::new(address, port)
    }
}

impl Default for Endpoint {
    fn default() -> Endpoint {
        Endpoint::Undefined
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Undefined => write!(f, "undefined"),
            Endpoint::V4(addr) => write!(f, "{}", addr),
            Endpoint::V6(addr) => write!(f, "{}", addr),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_v4() {
        let endpoint = Endpoint::new("127.0.0.1", 31540);
        assert_eq!(endpoint.endpoint_type(), EndpointType::IpV4);
        assert_eq!(endpoint.port(), 31540);
        assert_eq!(endpoint.address_string(), "127.0.0.1");
    }

    #[test]
    fn parse_v6_compressed() {
        let endpoint = Endpoint::new("2001:db8::1", 80);
        assert_eq!(endpoint.endpoint_type(), EndpointType::IpV6);
        assert_eq!(endpoint.address_string(), "2001:db8::1");
    }

    #[test]
    fn malformed_is_undefined() {
        assert_eq!(Endpoint::new("bla", 1234), Endpoint::Undefined);
        assert_eq!(Endpoint::new("256.0.0.1", 1234), Endpoint::Undefined);
        assert_eq!(Endpoint::new("", 1234), Endpoint::Undefined);
    }

    #[test]
    fn from_u32() {
        let endpoint = Endpoint::from_v4_u32(0x7F000001, 80);
        assert_eq!(endpoint.address_string(), "127.0.0.1");
    }

    #[test]
    fn comparison_is_bitwise() {
        let a = Endpoint::new("10.0.0.1", 80);
        let b = Endpoint::from_v4_bytes([10, 0, 0, 1], 80);
        assert_eq!(a, b);
        assert_ne!(a, Endpoint::new("10.0.0.1", 81));
    }
}
