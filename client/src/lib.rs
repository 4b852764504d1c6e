//! Anonymising BitTorrent core: file selection and piece priority planning
//! on one side, a SOCKS5 front-end that multiplexes client flows onto onion
//! circuits on the other.

pub mod cli;
pub mod error;
pub mod picker;
pub mod selector;
pub mod socks5;
pub mod storage;
pub mod tunnel;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::sync::mpsc;
use tracing::info;

use cli::TunnelConfig;
use tunnel::{CircuitPool, CircuitTransport, DispatcherEvent, TunnelDispatcher};

/// Binds the SOCKS5 listeners and runs them together with the dispatcher
/// service. `make_transport` receives the dispatcher's event queue.
pub async fn run_tunnel<T, F>(
    config: &TunnelConfig,
    make_transport: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    T: CircuitTransport + 'static,
    F: FnOnce(mpsc::UnboundedSender<DispatcherEvent>) -> T,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = Arc::new(make_transport(tx.clone()));
    let dispatcher = TunnelDispatcher::new(CircuitPool::new(transport));

    let servers = socks5::bind_all(config.bind, config.socks_port, config.max_hops).await?;
    let next_session = Arc::new(AtomicU64::new(1));
    for server in servers {
        tokio::spawn(server.run(tx.clone(), next_session.clone()));
    }
    drop(tx);

    info!("Tunnel dispatcher running");
    tunnel::service::run(dispatcher, rx, config.check_interval).await;
    Ok(())
}
