//! SOCKS5 listeners, one per hop count.

use super::connection::handle_connection;
use crate::tunnel::{EventSender, SessionId};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub struct Socks5Server {
    hops: u8,
    listener: TcpListener,
}

impl Socks5Server {
    pub async fn bind(addr: SocketAddr, hops: u8) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            "SOCKS5 listener for {} hops on {}",
            hops,
            listener.local_addr()?
        );
        Ok(Self { hops, listener })
    }

    pub fn hops(&self) -> u8 {
        self.hops
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever. Session ids come from `next_session`,
    /// shared by all listeners.
    pub async fn run(self, events: EventSender, next_session: Arc<AtomicU64>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let session: SessionId = next_session.fetch_add(1, Ordering::SeqCst);
                    debug!("Session {} from {}", session, addr);
                    let events = events.clone();
                    let hops = self.hops;
                    tokio::spawn(async move {
                        let _ = handle_connection(stream, session, hops, events).await;
                    });
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Binds listeners for hop counts `1..=max_hops`. With a non-zero
/// `base_port` hop `h` listens on `base_port + h - 1`.
pub async fn bind_all(ip: IpAddr, base_port: u16, max_hops: u8) -> std::io::Result<Vec<Socks5Server>> {
    let mut servers = Vec::with_capacity(max_hops as usize);
    for hops in 1..=max_hops {
        let port = if base_port == 0 {
            0
        } else {
            base_port.saturating_add(hops as u16 - 1)
        };
        servers.push(Socks5Server::bind(SocketAddr::new(ip, port), hops).await?);
    }
    Ok(servers)
}
