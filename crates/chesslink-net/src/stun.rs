//! External address discovery over STUN (RFC 5389)
//!
//! Only the Binding method is used. The resolver borrows the caller's UDP
//! socket so that the mapping it discovers is the one later used for hole
//! punching; NAT bindings are per local port, so a fresh socket would learn a
//! useless address.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{interval, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use chesslink_core::{FailureReason, PeerAddress, StunConfig, MAX_DATAGRAM_SIZE};

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const MAGIC_COOKIE: u32 = 0x2112_A442;
const HEADER_LEN: usize = 20;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// 96-bit STUN transaction identifier
pub type TransactionId = [u8; 12];

/// Resolver failures, after every configured server has been tried
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no STUN server answered in time")]
    Timeout,

    #[error("no usable STUN server")]
    Unavailable,
}

impl ResolveError {
    pub fn reason(&self) -> FailureReason {
        match self {
            ResolveError::Timeout => FailureReason::ResolutionTimeout,
            ResolveError::Unavailable => FailureReason::ResolutionUnavailable,
        }
    }
}

/// Why a datagram was not accepted as our binding response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StunParseError {
    #[error("datagram truncated")]
    Truncated,

    #[error("not a binding success response (type {0:#06x})")]
    NotBindingSuccess(u16),

    #[error("bad magic cookie")]
    BadCookie,

    #[error("transaction id mismatch")]
    TransactionMismatch,

    #[error("no mapped address attribute")]
    NoMappedAddress,

    #[error("unsupported address family {0:#04x}")]
    UnknownFamily(u8),
}

/// Outcome of querying a single server
#[derive(Debug)]
enum QueryError {
    Timeout,
    Unusable(String),
}

/// Generate a random transaction id
pub fn new_transaction_id() -> Result<TransactionId, getrandom::Error> {
    let mut id = [0u8; 12];
    getrandom::fill(&mut id)?;
    Ok(id)
}

/// Encode a Binding Request with no attributes
pub fn build_binding_request(transaction: &TransactionId) -> [u8; HEADER_LEN] {
    let mut msg = [0u8; HEADER_LEN];
    msg[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // length stays 0
    msg[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg[8..20].copy_from_slice(transaction);
    msg
}

/// Extract the mapped address from a Binding Success Response
///
/// XOR-MAPPED-ADDRESS wins over MAPPED-ADDRESS when both are present.
pub fn parse_binding_response(
    datagram: &[u8],
    transaction: &TransactionId,
) -> Result<PeerAddress, StunParseError> {
    if datagram.len() < HEADER_LEN {
        return Err(StunParseError::Truncated);
    }

    let msg_type = u16::from_be_bytes([datagram[0], datagram[1]]);
    if msg_type != BINDING_SUCCESS {
        return Err(StunParseError::NotBindingSuccess(msg_type));
    }
    let body_len = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
    let cookie = u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(StunParseError::BadCookie);
    }
    if &datagram[8..20] != transaction {
        return Err(StunParseError::TransactionMismatch);
    }
    let body = datagram
        .get(HEADER_LEN..HEADER_LEN + body_len)
        .ok_or(StunParseError::Truncated)?;

    let mut mapped = None;
    let mut offset = 0;
    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let value = body
            .get(offset + 4..offset + 4 + attr_len)
            .ok_or(StunParseError::Truncated)?;

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                return decode_address(value, Some(transaction));
            }
            ATTR_MAPPED_ADDRESS if mapped.is_none() => {
                mapped = Some(decode_address(value, None)?);
            }
            _ => {}
        }

        // attributes are padded to 4 bytes
        offset += 4 + (attr_len + 3) / 4 * 4;
    }

    mapped.ok_or(StunParseError::NoMappedAddress)
}

/// Decode an address attribute value, undoing the XOR when a transaction is given
fn decode_address(
    value: &[u8],
    xor_with: Option<&TransactionId>,
) -> Result<PeerAddress, StunParseError> {
    if value.len() < 4 {
        return Err(StunParseError::Truncated);
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let cookie = MAGIC_COOKIE.to_be_bytes();

    let ip = match family {
        FAMILY_IPV4 => {
            let raw: [u8; 4] = value
                .get(4..8)
                .and_then(|b| b.try_into().ok())
                .ok_or(StunParseError::Truncated)?;
            let mut octets = raw;
            if xor_with.is_some() {
                for (o, c) in octets.iter_mut().zip(cookie) {
                    *o ^= c;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 => {
            let raw: [u8; 16] = value
                .get(4..20)
                .and_then(|b| b.try_into().ok())
                .ok_or(StunParseError::Truncated)?;
            let mut octets = raw;
            if let Some(transaction) = xor_with {
                let key = cookie.iter().chain(transaction.iter());
                for (o, k) in octets.iter_mut().zip(key) {
                    *o ^= k;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(StunParseError::UnknownFamily(other)),
    };

    if xor_with.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }
    Ok(PeerAddress::new(ip, port))
}

/// Encode a Binding Success Response carrying XOR-MAPPED-ADDRESS
///
/// Used by the in-process STUN responder in tests.
#[cfg(test)]
pub(crate) fn build_binding_response(transaction: &TransactionId, mapped: SocketAddr) -> Vec<u8> {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut value = vec![0u8, 0];
    let xport = mapped.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match mapped.ip() {
        IpAddr::V4(v4) => {
            value[1] = FAMILY_IPV4;
            value.extend_from_slice(&xport.to_be_bytes());
            value.extend(v4.octets().iter().zip(cookie).map(|(o, c)| o ^ c));
        }
        IpAddr::V6(v6) => {
            value[1] = FAMILY_IPV6;
            value.extend_from_slice(&xport.to_be_bytes());
            let key = cookie.iter().chain(transaction.iter());
            value.extend(v6.octets().iter().zip(key).map(|(o, k)| o ^ k));
        }
    }

    let mut msg = Vec::with_capacity(HEADER_LEN + 4 + value.len());
    msg.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
    msg.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
    msg.extend_from_slice(&cookie);
    msg.extend_from_slice(transaction);
    msg.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    msg.extend_from_slice(&(value.len() as u16).to_be_bytes());
    msg.extend_from_slice(&value);
    msg
}

/// Learns the caller's public address from a list of STUN servers
#[derive(Debug, Clone)]
pub struct StunResolver {
    servers: Vec<String>,
    timeout: Duration,
    retransmit: Duration,
}

impl StunResolver {
    pub fn new(config: &StunConfig) -> Self {
        Self {
            servers: config.servers.clone(),
            timeout: config.timeout(),
            retransmit: config.retransmit(),
        }
    }

    /// Query the configured servers in order, returning the first mapping
    ///
    /// Fails with [`ResolveError::Timeout`] when every server was silent and
    /// with [`ResolveError::Unavailable`] when at least one could not be used
    /// at all.
    pub async fn resolve(&self, socket: &UdpSocket) -> Result<PeerAddress, ResolveError> {
        let mut all_timed_out = !self.servers.is_empty();

        for server in &self.servers {
            match self.query(socket, server).await {
                Ok(addr) => {
                    info!("STUN server {} reports public address {}", server, addr);
                    return Ok(addr);
                }
                Err(QueryError::Timeout) => {
                    warn!("STUN server {} did not answer within {:?}", server, self.timeout);
                }
                Err(QueryError::Unusable(e)) => {
                    warn!("STUN server {} unusable: {}", server, e);
                    all_timed_out = false;
                }
            }
        }

        if all_timed_out {
            Err(ResolveError::Timeout)
        } else {
            Err(ResolveError::Unavailable)
        }
    }

    async fn query(&self, socket: &UdpSocket, server: &str) -> Result<PeerAddress, QueryError> {
        let local = socket
            .local_addr()
            .map_err(|e| QueryError::Unusable(e.to_string()))?;
        let deadline = Instant::now() + self.timeout;
        let target = within_deadline(deadline, lookup_server(server, local)).await?;
        let transaction =
            new_transaction_id().map_err(|e| QueryError::Unusable(e.to_string()))?;
        let request = build_binding_request(&transaction);

        let mut retransmit = interval(self.retransmit);
        retransmit.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return Err(QueryError::Timeout),
                _ = retransmit.tick() => {
                    debug!("Sending STUN binding request to {}", target);
                    socket
                        .send_to(&request, target)
                        .await
                        .map_err(|e| QueryError::Unusable(e.to_string()))?;
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) if from == target => {
                        match parse_binding_response(&buf[..len], &transaction) {
                            Ok(addr) => return Ok(addr),
                            Err(e) => debug!("Ignoring datagram from {}: {}", from, e),
                        }
                    }
                    Ok((_, from)) => debug!("Ignoring datagram from {} during STUN", from),
                    Err(e) if is_transient(&e) => debug!("Transient receive error: {}", e),
                    Err(e) => return Err(QueryError::Unusable(e.to_string())),
                },
            }
        }
    }
}

/// Bound a step of a query by the server's deadline
async fn within_deadline<T, F>(deadline: Instant, step: F) -> Result<T, QueryError>
where
    F: Future<Output = Result<T, QueryError>>,
{
    timeout_at(deadline, step)
        .await
        .unwrap_or(Err(QueryError::Timeout))
}

/// Resolve a `host:port` server string to an address of the socket's family
async fn lookup_server(server: &str, local: SocketAddr) -> Result<SocketAddr, QueryError> {
    let candidates = lookup_host(server)
        .await
        .map_err(|e| QueryError::Unusable(format!("lookup failed: {}", e)))?;

    candidates
        .into_iter()
        .find(|addr| addr.is_ipv4() == local.is_ipv4())
        .ok_or_else(|| QueryError::Unusable("no address of a matching family".into()))
}

/// ICMP errors surface as resets on some platforms and only concern one datagram
pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused | io::ErrorKind::Interrupted
    )
}
