//! Maps SOCKS5 flows onto circuits and routes tunnel data back to clients.

use super::circuit::{CircuitId, CircuitKind, CircuitPool};
use bytes::Bytes;
use rand::Rng;
use seed_core::socks5::{Address, RENDEZVOUS_PORT, UdpPacket};
use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

pub type SessionId = u64;

struct UdpLink {
    socket: Arc<UdpSocket>,
    /// Client address replies go to, once known.
    remote: Option<SocketAddr>,
}

struct Session {
    hops: u8,
    udp: Option<UdpLink>,
}

struct Deferred {
    session: SessionId,
    destination: Address,
    data: Bytes,
}

pub struct TunnelDispatcher {
    pool: CircuitPool,
    sessions: HashMap<SessionId, Session>,
    flow_to_circuit: HashMap<(SessionId, Address), CircuitId>,
    circuit_to_session: HashMap<CircuitId, SessionId>,
    // Datagrams waiting for a circuit to become ready; retried once.
    deferred: HashMap<CircuitId, Vec<Deferred>>,
}

impl TunnelDispatcher {
    /// Creates a dispatcher with no sessions over `pool`.
    ///
    /// # Arguments
    ///
    /// * `pool` - The circuits to route over. New circuits are requested
    ///   through the pool's transport when a session has none.
    ///
    /// # Returns
    ///
    /// * `Self` - A dispatcher with empty flow and ownership tables.
    ///
    /// # Examples
    ///
    /// ```
    /// use onionseed::tunnel::{CircuitPool, DirectTransport, TunnelDispatcher};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    /// use tokio::sync::mpsc;
    ///
    /// let (events, _rx) = mpsc::unbounded_channel();
    /// let transport = Arc::new(DirectTransport::new(events, Duration::from_secs(30)));
    /// let mut dispatcher = TunnelDispatcher::new(CircuitPool::new(transport));
    /// dispatcher.open_session(1, 3);
    /// assert_eq!(dispatcher.session_hops(1), Some(3));
    /// ```
    pub fn new(pool: CircuitPool) -> Self {
        Self {
            pool,
            sessions: HashMap::new(),
            flow_to_circuit: HashMap::new(),
            circuit_to_session: HashMap::new(),
            deferred: HashMap::new(),
        }
    }

    pub fn pool(&self) -> &CircuitPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut CircuitPool {
        &mut self.pool
    }

    pub fn open_session(&mut self, session: SessionId, hops: u8) {
        self.sessions.insert(session, Session { hops, udp: None });
    }

    pub fn close_session(&mut self, session: SessionId) {
        if self.sessions.remove(&session).is_some() {
            self.connection_dead(session);
        }
    }

    pub fn session_hops(&self, session: SessionId) -> Option<u8> {
        self.sessions.get(&session).map(|s| s.hops)
    }

    /// Attaches the UDP socket opened for a session's UDP-ASSOCIATE.
    pub fn set_udp(&mut self, session: SessionId, socket: Arc<UdpSocket>, remote: Option<SocketAddr>) {
        if let Some(s) = self.sessions.get_mut(&session) {
            s.udp = Some(UdpLink { socket, remote });
        }
    }

    pub fn clear_udp(&mut self, session: SessionId) {
        if let Some(s) = self.sessions.get_mut(&session) {
            s.udp = None;
        }
    }

    pub fn flow_circuit(&self, session: SessionId, destination: &Address) -> Option<CircuitId> {
        self.flow_to_circuit
            .get(&(session, destination.clone()))
            .copied()
    }

    pub fn circuit_owner(&self, circuit: CircuitId) -> Option<SessionId> {
        self.circuit_to_session.get(&circuit).copied()
    }

    /// A datagram from a client's UDP association.
    ///
    /// The flow `(session, destination)` keeps its circuit while that
    /// circuit stays ready; otherwise a circuit is selected again.
    ///
    /// # Arguments
    ///
    /// * `session` - The SOCKS5 session the association belongs to.
    /// * `source` - The client address the datagram came from. The first
    ///   one seen becomes the address replies are sent to.
    /// * `destination` - Where the payload is headed.
    /// * `data` - The payload without its SOCKS5 UDP header.
    ///
    /// # Returns
    ///
    /// * `bool` - True if the payload went out on a circuit now. False if it
    ///   was dropped or is waiting for a new circuit to become ready.
    pub fn on_socks5_udp_data(
        &mut self,
        session: SessionId,
        source: Option<SocketAddr>,
        destination: Address,
        data: Bytes,
    ) -> bool {
        if let (Some(source), Some(link)) = (
            source,
            self.sessions.get_mut(&session).and_then(|s| s.udp.as_mut()),
        ) {
            link.remote.get_or_insert(source);
        }

        let key = (session, destination);
        if let Some(&cid) = self.flow_to_circuit.get(&key) {
            if self.pool.send(cid, &key.1, data.clone()) {
                return true;
            }
            debug!("Flow to {} lost circuit {}, selecting again", key.1, cid);
            self.flow_to_circuit.remove(&key);
        }

        let (session, destination) = key;
        match self.select_circuit(session, &destination, &data) {
            Some(cid) => self.pool.send(cid, &destination, data),
            None => false,
        }
    }

    /// Picks a circuit for `(session, destination)` and records the flow.
    ///
    /// When nothing is usable and the session owns no circuit yet, a new one
    /// is requested and `data` is queued until it becomes ready.
    pub fn select_circuit(
        &mut self,
        session: SessionId,
        destination: &Address,
        data: &Bytes,
    ) -> Option<CircuitId> {
        if let Some(ip) = destination.rendezvous_ip() {
            let cid = self.pool.transport().ip_to_circuit_id(ip);
            if self
                .pool
                .get(cid)
                .is_some_and(|c| c.is_ready() && c.kind.is_rendezvous())
            {
                return Some(cid);
            }
        }

        let hops = self.sessions.get(&session)?.hops;
        let candidates: Vec<CircuitId> = self
            .pool
            .circuits()
            .into_iter()
            .filter(|c| c.goal_hops == hops && c.is_ready() && c.kind == CircuitKind::Data)
            .filter(|c| {
                self.circuit_to_session
                    .get(&c.id)
                    .is_none_or(|&owner| owner == session)
            })
            .map(|c| c.id)
            .collect();

        if !candidates.is_empty() {
            let cid = candidates[rand::rng().random_range(0..candidates.len())];
            self.circuit_to_session.entry(cid).or_insert(session);
            self.flow_to_circuit.insert((session, destination.clone()), cid);
            return Some(cid);
        }

        if self.circuit_to_session.values().any(|&owner| owner == session) {
            debug!("No usable circuit for session {}, dropping datagram", session);
            return None;
        }

        let Some(cid) = self.pool.create_circuit(hops) else {
            warn!("Could not start a {}-hop circuit for session {}", hops, session);
            return None;
        };
        self.circuit_to_session.insert(cid, session);
        if self.pool.get(cid).is_some_and(|c| c.is_ready()) {
            self.flow_to_circuit.insert((session, destination.clone()), cid);
            return Some(cid);
        }
        self.deferred.entry(cid).or_default().push(Deferred {
            session,
            destination: destination.clone(),
            data: data.clone(),
        });
        None
    }

    /// Retries the datagrams that were waiting on `circuit`.
    pub fn on_circuit_ready(&mut self, circuit: CircuitId) {
        let Some(waiting) = self.deferred.remove(&circuit) else {
            return;
        };
        for item in waiting {
            if !self.sessions.contains_key(&item.session) {
                debug!("Session {} closed before circuit {} was ready", item.session, circuit);
                continue;
            }
            self.on_socks5_udp_data(item.session, None, item.destination, item.data);
        }
    }

    /// Delivers data that arrived on `circuit` to the owning client's UDP
    /// socket.
    ///
    /// Circuits nobody owns fall back to the first session with the matching
    /// hop count and a known client address.
    ///
    /// # Arguments
    ///
    /// * `circuit` - The circuit the data arrived on.
    /// * `origin` - The remote sender. Replaced by the circuit's virtual
    ///   address for rendezvous circuits.
    /// * `data` - The payload to wrap in a SOCKS5 UDP header.
    ///
    /// # Returns
    ///
    /// * `bool` - True if the datagram was handed to a client socket.
    pub fn on_incoming_from_tunnel(&mut self, circuit: CircuitId, origin: Address, data: Bytes) -> bool {
        let Some(c) = self.pool.get(circuit) else {
            debug!("Data on unknown circuit {}", circuit);
            return false;
        };
        let origin = if c.kind.is_rendezvous() {
            let ip = self.pool.transport().circuit_id_to_ip(circuit);
            Address::Socket(SocketAddr::V4(SocketAddrV4::new(ip, RENDEZVOUS_PORT)))
        } else {
            origin
        };
        let hops = match c.kind {
            CircuitKind::RendezvousDownloader => c.goal_hops.saturating_sub(1),
            _ => c.goal_hops,
        };

        // An owned circuit only ever answers its owner.
        let link = match self.circuit_to_session.get(&circuit) {
            Some(owner) => self.sessions.get(owner).and_then(|s| s.udp.as_ref()),
            None => {
                let mut ids: Vec<&SessionId> = self.sessions.keys().collect();
                ids.sort();
                ids.into_iter()
                    .filter_map(|id| self.sessions.get(id))
                    .filter(|s| s.hops == hops)
                    .filter_map(|s| s.udp.as_ref())
                    .find(|link| link.remote.is_some())
            }
        };
        let Some((socket, remote)) = link.and_then(|l| l.remote.map(|r| (&l.socket, r))) else {
            debug!("No session to deliver data from circuit {}", circuit);
            return false;
        };

        let packet = UdpPacket::new(origin, data).encode();
        match socket.try_send_to(&packet, remote) {
            Ok(_) => true,
            Err(e) => {
                warn!("Could not deliver datagram to {}: {}", remote, e);
                false
            }
        }
    }

    /// Forgets a destroyed circuit and returns the destinations whose flows
    /// used it.
    pub fn circuit_dead(&mut self, circuit: CircuitId) -> HashSet<Address> {
        self.pool.remove(circuit);
        self.circuit_to_session.remove(&circuit);
        self.deferred.remove(&circuit);

        let mut affected = HashSet::new();
        self.flow_to_circuit.retain(|(_, destination), cid| {
            if *cid == circuit {
                affected.insert(destination.clone());
                false
            } else {
                true
            }
        });
        affected
    }

    /// Drops circuit ownership held by sessions that lost their UDP socket.
    pub fn check_connections(&mut self) {
        let stale: Vec<(CircuitId, SessionId)> = self
            .circuit_to_session
            .iter()
            .filter(|&(_, s)| self.sessions.get(s).is_none_or(|s| s.udp.is_none()))
            .map(|(&c, &s)| (c, s))
            .collect();
        for (cid, session) in stale {
            self.circuit_to_session.remove(&cid);
            self.connection_dead(session);
        }
    }

    /// Removes every flow and circuit claim of `session`.
    pub fn connection_dead(&mut self, session: SessionId) {
        self.flow_to_circuit.retain(|(s, _), _| *s != session);
        self.circuit_to_session.retain(|_, s| *s != session);
        for waiting in self.deferred.values_mut() {
            waiting.retain(|d| d.session != session);
        }
        self.deferred.retain(|_, waiting| !waiting.is_empty());
    }
}
