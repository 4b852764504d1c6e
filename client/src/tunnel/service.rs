//! The task that owns the dispatcher and feeds it events.

use super::circuit::{Circuit, CircuitId, CircuitState};
use super::dispatcher::{SessionId, TunnelDispatcher};
use crate::error::TunnelError;
use bytes::Bytes;
use seed_core::socks5::Address;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Reports from the onion transport.
#[derive(Debug)]
pub enum CircuitEvent {
    Created(Circuit),
    StateChanged(CircuitId, CircuitState),
    Dead(CircuitId),
    Data {
        circuit: CircuitId,
        origin: Address,
        data: Bytes,
    },
}

pub enum DispatcherEvent {
    SessionOpened {
        session: SessionId,
        hops: u8,
    },
    SessionClosed(SessionId),
    UdpAssociated {
        session: SessionId,
        socket: Arc<UdpSocket>,
        remote: Option<SocketAddr>,
    },
    UdpClosed(SessionId),
    UdpData {
        session: SessionId,
        source: SocketAddr,
        destination: Address,
        data: Bytes,
    },
    TcpData {
        session: SessionId,
        destination: Address,
        data: Bytes,
        reply: oneshot::Sender<Result<Bytes, TunnelError>>,
    },
    Circuit(CircuitEvent),
}

pub type EventSender = mpsc::UnboundedSender<DispatcherEvent>;

/// Runs until every event sender is dropped.
pub async fn run(
    mut dispatcher: TunnelDispatcher,
    mut rx: mpsc::UnboundedReceiver<DispatcherEvent>,
    check_interval: Duration,
) {
    let mut ticker = tokio::time::interval(check_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => handle_event(&mut dispatcher, event),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                dispatcher.check_connections();
            }
        }
    }
    info!("Tunnel dispatcher stopped");
}

pub fn handle_event(dispatcher: &mut TunnelDispatcher, event: DispatcherEvent) {
    match event {
        DispatcherEvent::SessionOpened { session, hops } => {
            debug!("Session {} opened on the {}-hop listener", session, hops);
            dispatcher.open_session(session, hops);
        }
        DispatcherEvent::SessionClosed(session) => {
            debug!("Session {} closed", session);
            dispatcher.close_session(session);
        }
        DispatcherEvent::UdpAssociated {
            session,
            socket,
            remote,
        } => dispatcher.set_udp(session, socket, remote),
        DispatcherEvent::UdpClosed(session) => dispatcher.clear_udp(session),
        DispatcherEvent::UdpData {
            session,
            source,
            destination,
            data,
        } => {
            dispatcher.on_socks5_udp_data(session, Some(source), destination, data);
        }
        DispatcherEvent::TcpData {
            session,
            destination,
            data,
            reply,
        } => on_socks5_tcp_data(dispatcher, session, destination, data, reply),
        DispatcherEvent::Circuit(event) => on_circuit_event(dispatcher, event),
    }
}

// The HTTP exchange runs on its own task; the reply goes back to the
// connection that asked.
fn on_socks5_tcp_data(
    dispatcher: &TunnelDispatcher,
    session: SessionId,
    destination: Address,
    data: Bytes,
    reply: oneshot::Sender<Result<Bytes, TunnelError>>,
) {
    let Some(hops) = dispatcher.session_hops(session) else {
        let _ = reply.send(Err(TunnelError::CircuitUnavailable));
        return;
    };
    let request = dispatcher
        .pool()
        .transport()
        .perform_http_request(destination.clone(), data, hops);
    tokio::spawn(async move {
        let result = request.await;
        if let Err(e) = &result {
            warn!("Request to {} failed: {}", destination, e);
        }
        let _ = reply.send(result);
    });
}

fn on_circuit_event(dispatcher: &mut TunnelDispatcher, event: CircuitEvent) {
    match event {
        CircuitEvent::Created(circuit) => {
            info!("Transport added circuit {}", circuit.id);
            let ready = circuit.is_ready();
            let id = circuit.id;
            dispatcher.pool_mut().insert(circuit);
            if ready {
                dispatcher.on_circuit_ready(id);
            }
        }
        CircuitEvent::StateChanged(id, CircuitState::Dead) | CircuitEvent::Dead(id) => {
            let affected = dispatcher.circuit_dead(id);
            info!("Circuit {} died, {} flows affected", id, affected.len());
            if !affected.is_empty() {
                let mut destinations: Vec<String> = affected.iter().map(|d| d.to_string()).collect();
                destinations.sort();
                debug!("Flows of circuit {} will reselect: {}", id, destinations.join(", "));
            }
        }
        CircuitEvent::StateChanged(id, state) => {
            if dispatcher.pool_mut().set_state(id, state) {
                info!("Circuit {} is ready", id);
                dispatcher.on_circuit_ready(id);
            }
        }
        CircuitEvent::Data {
            circuit,
            origin,
            data,
        } => {
            dispatcher.on_incoming_from_tunnel(circuit, origin, data);
        }
    }
}
