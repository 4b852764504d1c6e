//! A transport without relays: every circuit is a local UDP socket that
//! talks to destinations directly. Offers no anonymity.

use super::circuit::{Circuit, CircuitId, CircuitKind, CircuitState, CircuitTransport, HttpFuture};
use super::service::{CircuitEvent, DispatcherEvent, EventSender};
use crate::error::TunnelError;
use bytes::Bytes;
use parking_lot::Mutex;
use seed_core::socks5::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

pub struct DirectTransport {
    events: EventSender,
    next_id: AtomicU32,
    sockets: Arc<Mutex<HashMap<CircuitId, Arc<UdpSocket>>>>,
    http_timeout: Duration,
}

impl DirectTransport {
    pub fn new(events: EventSender, http_timeout: Duration) -> Self {
        Self {
            events,
            next_id: AtomicU32::new(1),
            sockets: Arc::new(Mutex::new(HashMap::new())),
            http_timeout,
        }
    }

    fn bind_socket() -> std::io::Result<UdpSocket> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket)
    }
}

impl CircuitTransport for DirectTransport {
    fn create_circuit(&self, goal_hops: u8) -> Option<Circuit> {
        let socket = match Self::bind_socket() {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!("Could not open circuit socket: {}", e);
                return None;
            }
        };
        let peer = socket.local_addr().ok()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sockets.lock().insert(id, socket.clone());

        let events = self.events.clone();
        let sockets = self.sockets.clone();
        tokio::spawn(async move {
            let _ = events.send(DispatcherEvent::Circuit(CircuitEvent::StateChanged(
                id,
                CircuitState::Ready,
            )));
            let mut buf = vec![0u8; 65536];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        let event = CircuitEvent::Data {
                            circuit: id,
                            origin: Address::Socket(from),
                            data: Bytes::copy_from_slice(&buf[..n]),
                        };
                        if events.send(DispatcherEvent::Circuit(event)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Circuit {} socket closed: {}", id, e);
                        let _ = events.send(DispatcherEvent::Circuit(CircuitEvent::Dead(id)));
                        break;
                    }
                }
            }
            sockets.lock().remove(&id);
        });

        Some(Circuit {
            id,
            hops: 0,
            goal_hops,
            state: CircuitState::Building,
            kind: CircuitKind::Data,
            peer,
        })
    }

    fn send_data(&self, circuit: &Circuit, destination: &Address, _origin: &Address, payload: Bytes) {
        let Some(socket) = self.sockets.lock().get(&circuit.id).cloned() else {
            return;
        };
        match destination {
            Address::Socket(addr) => {
                if let Err(e) = socket.try_send_to(&payload, *addr) {
                    debug!("Send to {} failed: {}", addr, e);
                }
            }
            Address::Domain(..) => {
                let target = destination.to_string();
                tokio::spawn(async move {
                    if let Err(e) = socket.send_to(&payload, target.as_str()).await {
                        debug!("Send to {} failed: {}", target, e);
                    }
                });
            }
        }
    }

    fn perform_http_request(&self, destination: Address, request: Bytes, _hops: u8) -> HttpFuture {
        let timeout = self.http_timeout;
        Box::pin(async move {
            let exchange = async {
                let mut stream = TcpStream::connect(destination.to_string()).await?;
                stream.write_all(&request).await?;
                stream.shutdown().await?;
                let mut response = Vec::new();
                stream.read_to_end(&mut response).await?;
                Ok::<_, std::io::Error>(Bytes::from(response))
            };
            match tokio::time::timeout(timeout, exchange).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(TunnelError::Timeout),
            }
        })
    }
}
