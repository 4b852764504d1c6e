//! Local SOCKS5 front-end: listeners, connection handling and UDP relays.

pub mod connection;
pub mod server;
pub mod udp;

pub use connection::{Action, ConnectionState, Socks5Connection, handle_connection};
pub use server::{Socks5Server, bind_all};
pub use udp::UdpAssociation;
