//! In-process stand-ins for the STUN and rendezvous servers

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use chesslink_core::protocol::{JoinRequest, JoinResponse, RegisterRequest};
use chesslink_core::{PeerAddress, PollResponse, SessionToken};

use crate::stun::{build_binding_response, TransactionId};

/// Answer binding requests with `mapped`, or with the request's source
pub async fn spawn_stun_responder(mapped: Option<SocketAddr>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            if len < 20 || buf[0..2] != [0x00, 0x01] {
                continue;
            }
            let mut transaction: TransactionId = [0; 12];
            transaction.copy_from_slice(&buf[8..20]);
            let reply = build_binding_response(&transaction, mapped.unwrap_or(from));
            let _ = socket.send_to(&reply, from).await;
        }
    });

    addr
}

/// A bound UDP socket nobody reads; keep the socket alive for the test
pub async fn spawn_silent_udp() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

/// Accepts TCP connections and never answers
pub async fn spawn_black_hole_http() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (addr, task)
}

/// Answers every request with the same status line and body, counting hits
pub async fn spawn_status_http(
    status: &'static str,
    body: &'static str,
) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                if read_request(&mut stream).await.is_some() {
                    counter.fetch_add(1, Ordering::SeqCst);
                    write_response(&mut stream, status, body).await;
                }
            });
        }
    });

    (addr, hits)
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    host: PeerAddress,
    joiner: Option<PeerAddress>,
}

/// Minimal rendezvous server speaking the client's HTTP API
pub struct FakeRendezvous {
    addr: SocketAddr,
    sessions: Arc<DashMap<u64, Entry>>,
}

impl FakeRendezvous {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sessions: Arc<DashMap<u64, Entry>> = Arc::new(DashMap::new());

        let state = sessions.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Some(request) = read_request(&mut stream).await {
                        let (status, body) = route(&state, request);
                        write_response(&mut stream, status, &body).await;
                    }
                });
            }
        });

        Self { addr, sessions }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Register a host directly, bypassing HTTP
    pub fn seed(&self, token: SessionToken, host: PeerAddress) {
        self.sessions.insert(token.value(), Entry { host, joiner: None });
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn route(sessions: &DashMap<u64, Entry>, request: Request) -> (&'static str, String) {
    let segments: Vec<&str> = request.path.trim_matches('/').split('/').collect();

    match (request.method.as_str(), segments.as_slice()) {
        ("POST", ["sessions"]) => {
            let Ok(register) = serde_json::from_slice::<RegisterRequest>(&request.body) else {
                return ("400 Bad Request", String::new());
            };
            let token = register.token.value();
            if sessions.contains_key(&token) {
                return ("409 Conflict", String::new());
            }
            sessions.insert(
                token,
                Entry {
                    host: register.address,
                    joiner: None,
                },
            );
            ("201 Created", String::new())
        }
        ("GET", ["sessions", token, "peer"]) => {
            let Some(entry) = token.parse::<u64>().ok().and_then(|t| sessions.get(&t)) else {
                return ("404 Not Found", String::new());
            };
            let poll = match entry.joiner {
                Some(address) => PollResponse::Found { address },
                None => PollResponse::Pending,
            };
            ("200 OK", serde_json::to_string(&poll).unwrap())
        }
        ("POST", ["sessions", token, "join"]) => {
            let Ok(join) = serde_json::from_slice::<JoinRequest>(&request.body) else {
                return ("400 Bad Request", String::new());
            };
            let Some(mut entry) = token.parse::<u64>().ok().and_then(|t| sessions.get_mut(&t))
            else {
                return ("404 Not Found", String::new());
            };
            entry.joiner = Some(join.address);
            let response = JoinResponse {
                address: entry.host,
            };
            ("200 OK", serde_json::to_string(&response).unwrap())
        }
        _ => ("404 Not Found", String::new()),
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Some(Request {
        method,
        path,
        body: buf[header_end..header_end + content_length].to_vec(),
    })
}

async fn write_response(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
