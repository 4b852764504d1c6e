//! One SOCKS5 client connection: a byte-driven state machine plus the task
//! that runs it over a TCP stream.

use super::udp::{self, UdpAssociation};
use crate::error::SocksError;
use crate::tunnel::{DispatcherEvent, EventSender, SessionId};
use bytes::{Buf, Bytes, BytesMut};
use seed_core::socks5::{
    Address, CMD_BIND, CMD_CONNECT, CMD_UDP_ASSOCIATE, CommandRequest, CommandResponse,
    METHOD_NO_ACCEPTABLE, METHOD_NO_AUTH, MethodsRequest, REP_COMMAND_NOT_SUPPORTED,
    REP_SUCCEEDED, SOCKS_VERSION, WireError, encode_method_response,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    BeforeMethods,
    Connected,
    /// Waiting for the UDP socket of an associate request.
    RequestReceived,
    Accepted,
}

/// What the connection task must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Reply(Bytes),
    /// Open a UDP relay; datagrams are expected from `remote`.
    AssociateUdp { remote: Address },
    /// Hand `data` to the dispatcher as one request to `destination`.
    Relay { destination: Address, data: Bytes },
    Close,
}

pub struct Socks5Connection {
    state: ConnectionState,
    buffer: BytesMut,
    local: SocketAddr,
    connect_to: Option<Address>,
}

impl Socks5Connection {
    /// `local` is the listener-side address reported in replies.
    pub fn new(local: SocketAddr) -> Self {
        Self {
            state: ConnectionState::BeforeMethods,
            buffer: BytesMut::new(),
            local,
            connect_to: None,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Consumes bytes from the client and returns the resulting actions.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Action>, SocksError> {
        self.buffer.extend_from_slice(data);
        let mut actions = Vec::new();

        while !self.buffer.is_empty() {
            match self.state {
                ConnectionState::BeforeMethods => {
                    let (request, used) = match MethodsRequest::decode(&self.buffer) {
                        Ok(r) => r,
                        Err(WireError::Truncated) => break,
                        Err(e) => return Err(e.into()),
                    };
                    if request.version != SOCKS_VERSION {
                        return Err(WireError::UnsupportedVersion(request.version).into());
                    }
                    self.buffer.advance(used);
                    if !request.methods.contains(&METHOD_NO_AUTH) {
                        actions.push(Action::Reply(encode_method_response(METHOD_NO_ACCEPTABLE)));
                        actions.push(Action::Close);
                        return Ok(actions);
                    }
                    actions.push(Action::Reply(encode_method_response(METHOD_NO_AUTH)));
                    self.state = ConnectionState::Connected;
                }
                ConnectionState::Connected => {
                    let (request, used) = match CommandRequest::decode(&self.buffer) {
                        Ok(r) => r,
                        Err(WireError::Truncated) => break,
                        // The request length is unknown, so the stream cannot resync.
                        Err(e @ (WireError::UnknownAddressType(_) | WireError::InvalidDomain)) => {
                            debug!("Bad SOCKS5 request: {}", e);
                            self.buffer.clear();
                            actions.push(self.reply(REP_COMMAND_NOT_SUPPORTED, Address::unspecified()));
                            actions.push(Action::Close);
                            return Ok(actions);
                        }
                        Err(e) => return Err(e.into()),
                    };
                    if request.version != SOCKS_VERSION {
                        return Err(WireError::UnsupportedVersion(request.version).into());
                    }
                    self.buffer.advance(used);
                    actions.push(self.on_command(request));
                }
                ConnectionState::RequestReceived => break,
                ConnectionState::Accepted => match &self.connect_to {
                    Some(destination) => {
                        let data = self.buffer.split().freeze();
                        actions.push(Action::Relay {
                            destination: destination.clone(),
                            data,
                        });
                    }
                    None => self.buffer.clear(),
                },
            }
        }
        Ok(actions)
    }

    fn on_command(&mut self, request: CommandRequest) -> Action {
        match request.command {
            CMD_UDP_ASSOCIATE => {
                self.state = ConnectionState::RequestReceived;
                Action::AssociateUdp {
                    remote: request.destination,
                }
            }
            CMD_CONNECT => {
                debug!("CONNECT to {}", request.destination);
                self.connect_to = Some(request.destination);
                self.state = ConnectionState::Accepted;
                self.reply(REP_SUCCEEDED, Address::Socket(self.local))
            }
            CMD_BIND => {
                self.state = ConnectionState::Accepted;
                self.reply(REP_SUCCEEDED, Address::Socket(self.local))
            }
            other => {
                debug!("Unsupported SOCKS5 command {:#04x}", other);
                self.reply(REP_COMMAND_NOT_SUPPORTED, Address::unspecified())
            }
        }
    }

    /// Completes a UDP-ASSOCIATE once the relay socket is bound.
    pub fn udp_bound(&mut self, bind: SocketAddr) -> Bytes {
        self.state = ConnectionState::Accepted;
        CommandResponse::new(REP_SUCCEEDED, Address::Socket(bind)).encode()
    }

    fn reply(&self, code: u8, bind: Address) -> Action {
        Action::Reply(CommandResponse::new(code, bind).encode())
    }
}

/// Drives one accepted connection until the client goes away.
pub async fn handle_connection(
    mut stream: TcpStream,
    session: SessionId,
    hops: u8,
    events: EventSender,
) -> Result<(), SocksError> {
    let _ = events.send(DispatcherEvent::SessionOpened { session, hops });

    let mut udp_task = None;
    let result = serve(&mut stream, session, &events, &mut udp_task).await;

    if let Some(task) = udp_task {
        task.abort();
    }
    let _ = events.send(DispatcherEvent::SessionClosed(session));
    if let Err(e) = &result {
        warn!("Session {} ended: {}", session, e);
    }
    result
}

async fn serve(
    stream: &mut TcpStream,
    session: SessionId,
    events: &EventSender,
    udp_task: &mut Option<JoinHandle<()>>,
) -> Result<(), SocksError> {
    let local = stream.local_addr()?;
    let mut fsm = Socks5Connection::new(local);
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        for action in fsm.feed(&buf[..n])? {
            match action {
                Action::Reply(bytes) => stream.write_all(&bytes).await?,
                Action::AssociateUdp { remote } => {
                    let socket = Arc::new(UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await?);
                    let bind = socket.local_addr()?;
                    let association = UdpAssociation::new(socket.clone(), &remote);
                    let _ = events.send(DispatcherEvent::UdpAssociated {
                        session,
                        socket,
                        remote: association.remote(),
                    });
                    *udp_task = Some(tokio::spawn(udp::run(association, session, events.clone())));
                    debug!("Session {} relays UDP on {}", session, bind);
                    stream.write_all(&fsm.udp_bound(bind)).await?;
                }
                Action::Relay { destination, data } => {
                    let (reply, response) = oneshot::channel();
                    let _ = events.send(DispatcherEvent::TcpData {
                        session,
                        destination,
                        data,
                        reply,
                    });
                    if let Ok(Ok(body)) = response.await {
                        stream.write_all(&body).await?;
                    }
                    return Ok(());
                }
                Action::Close => {
                    return Err(match fsm.state() {
                        ConnectionState::BeforeMethods => SocksError::NoAcceptableMethod,
                        _ => SocksError::BadRequest,
                    });
                }
            }
        }
    }
}
