//! Circuits as the dispatcher sees them, and the pool that tracks them.

use crate::error::TunnelError;
use bytes::Bytes;
use seed_core::socks5::{self, Address};
use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

pub type CircuitId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Building,
    Ready,
    Closing,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitKind {
    Data,
    RendezvousDownloader,
    RendezvousSeeder,
}

impl CircuitKind {
    pub fn is_rendezvous(self) -> bool {
        matches!(
            self,
            CircuitKind::RendezvousDownloader | CircuitKind::RendezvousSeeder
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    pub id: CircuitId,
    pub hops: u8,
    pub goal_hops: u8,
    pub state: CircuitState,
    pub kind: CircuitKind,
    /// First hop of the circuit.
    pub peer: SocketAddr,
}

impl Circuit {
    pub fn is_ready(&self) -> bool {
        self.state == CircuitState::Ready
    }
}

pub type HttpFuture = Pin<Box<dyn Future<Output = Result<Bytes, TunnelError>> + Send>>;

/// The onion transport underneath the dispatcher.
///
/// Circuits it builds on its own, state changes and inbound data are
/// reported back through the dispatcher's event queue.
pub trait CircuitTransport: Send + Sync {
    /// Starts building a circuit, or returns `None` if none can be started.
    fn create_circuit(&self, goal_hops: u8) -> Option<Circuit>;

    /// Best effort. Never called for a circuit that is not `Ready`.
    fn send_data(&self, circuit: &Circuit, destination: &Address, origin: &Address, payload: Bytes);

    /// One-shot request/response exchange with `destination` over `hops` hops.
    fn perform_http_request(&self, destination: Address, request: Bytes, hops: u8) -> HttpFuture;

    fn circuit_id_to_ip(&self, circuit_id: CircuitId) -> Ipv4Addr {
        socks5::circuit_id_to_ip(circuit_id)
    }

    fn ip_to_circuit_id(&self, ip: Ipv4Addr) -> CircuitId {
        socks5::ip_to_circuit_id(ip)
    }
}

/// Registry of live circuits, keyed by id.
pub struct CircuitPool {
    circuits: HashMap<CircuitId, Circuit>,
    transport: Arc<dyn CircuitTransport>,
}

impl CircuitPool {
    pub fn new(transport: Arc<dyn CircuitTransport>) -> Self {
        Self {
            circuits: HashMap::new(),
            transport,
        }
    }

    pub fn transport(&self) -> &Arc<dyn CircuitTransport> {
        &self.transport
    }

    pub fn create_circuit(&mut self, goal_hops: u8) -> Option<CircuitId> {
        let circuit = self.transport.create_circuit(goal_hops)?;
        let id = circuit.id;
        info!("Building {}-hop circuit {}", goal_hops, id);
        self.circuits.insert(id, circuit);
        Some(id)
    }

    /// Snapshot of the current circuits in id order.
    pub fn circuits(&self) -> Vec<&Circuit> {
        let mut all: Vec<&Circuit> = self.circuits.values().collect();
        all.sort_by_key(|c| c.id);
        all
    }

    pub fn get(&self, id: CircuitId) -> Option<&Circuit> {
        self.circuits.get(&id)
    }

    /// Registers a circuit the transport built on its own.
    pub fn insert(&mut self, circuit: Circuit) {
        self.circuits.insert(circuit.id, circuit);
    }

    /// Returns true if the circuit exists and just became `Ready`.
    pub fn set_state(&mut self, id: CircuitId, state: CircuitState) -> bool {
        match self.circuits.get_mut(&id) {
            Some(circuit) => {
                let became_ready = state == CircuitState::Ready && circuit.state != state;
                circuit.state = state;
                if circuit.hops < circuit.goal_hops && became_ready {
                    circuit.hops = circuit.goal_hops;
                }
                became_ready
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: CircuitId) -> Option<Circuit> {
        self.circuits.remove(&id)
    }

    /// Sends on a `Ready` circuit. Returns false without sending otherwise.
    pub fn send(&self, id: CircuitId, destination: &Address, payload: Bytes) -> bool {
        match self.circuits.get(&id) {
            Some(circuit) if circuit.is_ready() => {
                self.transport
                    .send_data(circuit, destination, &Address::unspecified(), payload);
                true
            }
            _ => {
                debug!("Circuit {} is not ready, not sending", id);
                false
            }
        }
    }
}
