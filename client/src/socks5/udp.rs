//! UDP relay opened by UDP-ASSOCIATE.

use crate::tunnel::{DispatcherEvent, EventSender, SessionId};
use seed_core::socks5::{Address, UdpPacket};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::debug;

pub struct UdpAssociation {
    socket: Arc<UdpSocket>,
    remote: Option<SocketAddr>,
}

impl UdpAssociation {
    /// `requested` is the client address from the associate request;
    /// `0.0.0.0:0` leaves it to be learned from the first datagram.
    pub fn new(socket: Arc<UdpSocket>, requested: &Address) -> Self {
        let remote = if requested.is_unspecified() {
            None
        } else {
            requested.as_socket_addr()
        };
        Self { socket, remote }
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Parses a datagram from `source`, pinning the client address on first
    /// use. Datagrams from anyone else, malformed ones and fragments are
    /// dropped.
    pub fn accept(&mut self, source: SocketAddr, datagram: &[u8]) -> Option<UdpPacket> {
        match self.remote {
            Some(remote) if remote != source => {
                debug!("Dropping datagram from unexpected source {}", source);
                return None;
            }
            Some(_) => {}
            None => self.remote = Some(source),
        }
        let packet = match UdpPacket::decode(datagram) {
            Ok(p) => p,
            Err(e) => {
                debug!("Dropping malformed datagram from {}: {}", source, e);
                return None;
            }
        };
        if packet.frag != 0 {
            debug!("Dropping fragment {} from {}", packet.frag, source);
            return None;
        }
        Some(packet)
    }
}

/// Forwards the client's datagrams to the dispatcher until the socket fails.
pub async fn run(mut association: UdpAssociation, session: SessionId, events: EventSender) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, source) = match association.socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                debug!("UDP relay of session {} closed: {}", session, e);
                break;
            }
        };
        let Some(packet) = association.accept(source, &buf[..n]) else {
            continue;
        };
        let event = DispatcherEvent::UdpData {
            session,
            source,
            destination: packet.destination,
            data: packet.data,
        };
        if events.send(event).is_err() {
            break;
        }
    }
    let _ = events.send(DispatcherEvent::UdpClosed(session));
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    async fn association(requested: &Address) -> UdpAssociation {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        UdpAssociation::new(socket, requested)
    }

    fn datagram(frag: u8) -> Vec<u8> {
        let mut packet = UdpPacket::new(
            Address::Socket("1.2.3.4:80".parse().unwrap()),
            Bytes::from_static(b"data"),
        );
        packet.frag = frag;
        packet.encode().to_vec()
    }

    #[tokio::test]
    async fn test_pins_first_source() {
        let mut assoc = association(&Address::unspecified()).await;
        let a: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        assert!(assoc.accept(a, &datagram(0)).is_some());
        assert_eq!(assoc.remote(), Some(a));
        assert!(assoc.accept(b, &datagram(0)).is_none());
    }

    #[tokio::test]
    async fn test_requested_address_is_pinned() {
        let client: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        let mut assoc = association(&Address::Socket(client)).await;
        assert!(assoc.accept("127.0.0.1:6001".parse().unwrap(), &datagram(0)).is_none());
        let packet = assoc.accept(client, &datagram(0)).unwrap();
        assert_eq!(packet.data, Bytes::from_static(b"data"));
    }

    #[tokio::test]
    async fn test_drops_fragments_and_garbage() {
        let mut assoc = association(&Address::unspecified()).await;
        let a: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert!(assoc.accept(a, &datagram(1)).is_none());
        assert!(assoc.accept(a, &[0, 0]).is_none());
    }
}
