//! Networking handles: TCP client/server, UDP client/server and the
//! protocol-agnostic [`Endpoint`] address type.

mod dns;
mod endpoint;
pub(crate) mod protocol_version;
pub(crate) mod tcp_client;
pub(crate) mod tcp_conn;
pub(crate) mod tcp_server;
pub(crate) mod udp_client;
pub(crate) mod udp_peer;
pub(crate) mod udp_server;

mod stream;

pub use self::dns::resolve_host;
pub use self::endpoint::{Endpoint, EndpointType};
pub use self::protocol_version::{DtlsVersion, DtlsVersionRange, TlsVersion, TlsVersionRange};
pub use self::tcp_client::TcpClient;
pub use self::tcp_conn::TcpConnectedClient;
pub use self::tcp_server::TcpServer;
pub use self::udp_client::UdpClient;
pub use self::udp_peer::UdpPeer;
pub use self::udp_server::UdpServer;
