//! Established peer-to-peer session
//!
//! A [`Session`] owns the UDP socket that won the hole punch. A background
//! pump reads the socket, drops anything not from the peer, answers stray
//! probes, swallows keepalives and acks, and forwards application datagrams
//! to the [`Incoming`] stream. The same task sends keepalives so the NAT
//! binding survives long thinking times.
//!
//! NAT rebinding is not followed: datagrams from a new source port are
//! dropped like any other stranger's.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use chesslink_core::protocol::{Control, KEEPALIVE, PROBE_ACK};
use chesslink_core::{PeerAddress, SessionConfig, MAX_DATAGRAM_SIZE, RECV_BUFFER_SIZE};

use crate::stun::is_transient;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,

    #[error("datagram of {0} bytes is too large")]
    TooLarge(usize),

    #[error("send failed: {0}")]
    Io(#[from] io::Error),
}

/// A connected UDP path to one peer
pub struct Session {
    peer: PeerAddress,
    local_addr: Option<SocketAddr>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    closed: Arc<AtomicBool>,
    pump: JoinHandle<()>,
    incoming: Option<Incoming>,
}

impl Session {
    /// Take ownership of a punched socket and start the receive pump
    ///
    /// `first` is an application datagram that arrived during probing.
    pub(crate) fn start(
        socket: UdpSocket,
        peer: PeerAddress,
        config: &SessionConfig,
        first: Option<Bytes>,
    ) -> Self {
        let local_addr = socket.local_addr().ok();
        let socket = Arc::new(socket);
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));

        if let Some(datagram) = first {
            let _ = tx.try_send(datagram);
        }

        let pump = tokio::spawn(pump(socket.clone(), peer, tx, config.keepalive()));
        info!("Session established with {}", peer);

        Self {
            peer,
            local_addr,
            socket: Mutex::new(Some(socket)),
            closed: closed.clone(),
            pump,
            incoming: Some(Incoming { rx, closed }),
        }
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Hand out the stream of received datagrams; only the first call gets it
    pub fn incoming(&mut self) -> Option<Incoming> {
        self.incoming.take()
    }

    /// Send one datagram to the peer
    pub async fn send(&self, payload: &[u8]) -> Result<(), SessionError> {
        if payload.len() > MAX_DATAGRAM_SIZE {
            return Err(SessionError::TooLarge(payload.len()));
        }
        let socket = self.socket.lock().clone().ok_or(SessionError::Closed)?;
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        socket.send_to(payload, self.peer.socket_addr()).await?;
        trace!("Sent {} bytes to {}", payload.len(), self.peer);
        Ok(())
    }

    /// Stop the pump and release the socket; safe to call more than once
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pump.abort();
        self.socket.lock().take();
        info!("Session with {} closed", self.peer);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Datagrams received from the peer, in arrival order
///
/// Ends once the session is closed; nothing buffered is yielded after that.
#[derive(Debug)]
pub struct Incoming {
    rx: mpsc::Receiver<Bytes>,
    closed: Arc<AtomicBool>,
}

impl Incoming {
    pub async fn recv(&mut self) -> Option<Bytes> {
        futures_util::StreamExt::next(self).await
    }
}

impl Stream for Incoming {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        if self.closed.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

async fn pump(
    socket: Arc<UdpSocket>,
    peer: PeerAddress,
    tx: mpsc::Sender<Bytes>,
    keepalive: Option<Duration>,
) {
    let mut keepalive = keepalive.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) if is_transient(&e) => {
                        debug!("Transient receive error: {}", e);
                        continue;
                    }
                    Err(e) => {
                        warn!("Session receive failed: {}", e);
                        break;
                    }
                };

                if !peer.matches(from) {
                    debug!("Dropping {} bytes from unexpected source {}", len, from);
                    continue;
                }
                if len > MAX_DATAGRAM_SIZE {
                    warn!("Dropping oversized datagram ({} bytes) from {}", len, peer);
                    continue;
                }

                match Control::parse(&buf[..len]) {
                    Some(Control::Probe) => {
                        // The peer missed our ack; repeat it
                        if let Err(e) = socket.send_to(PROBE_ACK, peer.socket_addr()).await {
                            debug!("Failed to re-ack probe: {}", e);
                        }
                    }
                    Some(_) => {}
                    None => match tx.try_send(Bytes::copy_from_slice(&buf[..len])) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!("Receive buffer full, dropping datagram from {}", peer);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            trace!("Reader gone, discarding datagram");
                        }
                    },
                }
            }
            _ = next_tick(&mut keepalive) => {
                if let Err(e) = socket.send_to(KEEPALIVE, peer.socket_addr()).await {
                    debug!("Keepalive to {} failed: {}", peer, e);
                }
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chesslink_core::protocol::PROBE;
    use futures_util::StreamExt;
    use tokio::time::timeout;

    async fn pair(config: &SessionConfig) -> (Session, UdpSocket) {
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = PeerAddress::from(remote.local_addr().unwrap());
        (Session::start(local, peer, config, None), remote)
    }

    fn no_keepalive() -> SessionConfig {
        SessionConfig {
            keepalive_ms: 0,
            channel_capacity: 16,
        }
    }

    async fn recv_from(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 1500];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        buf[..len].to_vec()
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (mut session, remote) = pair(&no_keepalive()).await;
        let mut incoming = session.incoming().unwrap();
        let local = session.local_addr().unwrap();

        session.send(b"e2e4").await.unwrap();
        assert_eq!(recv_from(&remote).await, b"e2e4");

        remote.send_to(b"e7e5", local).await.unwrap();
        let got = timeout(Duration::from_secs(2), incoming.next()).await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"e7e5"[..]));
    }

    #[tokio::test]
    async fn test_incoming_handed_out_once() {
        let (mut session, _remote) = pair(&no_keepalive()).await;
        assert!(session.incoming().is_some());
        assert!(session.incoming().is_none());
    }

    #[tokio::test]
    async fn test_filters_strangers_and_control() {
        let (mut session, remote) = pair(&no_keepalive()).await;
        let mut incoming = session.incoming().unwrap();
        let local = session.local_addr().unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        stranger.send_to(b"spoofed", local).await.unwrap();
        remote.send_to(KEEPALIVE, local).await.unwrap();
        remote.send_to(PROBE_ACK, local).await.unwrap();
        remote.send_to(b"Nf3", local).await.unwrap();

        let got = timeout(Duration::from_secs(2), incoming.next()).await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"Nf3"[..]));
    }

    #[tokio::test]
    async fn test_late_probe_is_acked() {
        let (session, remote) = pair(&no_keepalive()).await;
        remote.send_to(PROBE, session.local_addr().unwrap()).await.unwrap();
        assert_eq!(recv_from(&remote).await, PROBE_ACK);
    }

    #[tokio::test]
    async fn test_keepalives_are_sent() {
        let config = SessionConfig {
            keepalive_ms: 30,
            channel_capacity: 16,
        };
        let (_session, remote) = pair(&config).await;
        assert_eq!(recv_from(&remote).await, KEEPALIVE);
        assert_eq!(recv_from(&remote).await, KEEPALIVE);
    }

    #[tokio::test]
    async fn test_first_datagram_is_delivered() {
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = PeerAddress::from("127.0.0.1:9".parse::<SocketAddr>().unwrap());
        let first = Some(Bytes::from_static(b"hello"));
        let mut session = Session::start(local, peer, &no_keepalive(), first);
        let mut incoming = session.incoming().unwrap();
        assert_eq!(incoming.recv().await.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (mut session, remote) = pair(&no_keepalive()).await;
        let mut incoming = session.incoming().unwrap();
        let local = session.local_addr().unwrap();

        // Buffered before close, never delivered after it
        remote.send_to(b"d4", local).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.close();
        session.close();
        assert!(session.is_closed());
        assert!(matches!(session.send(b"d5").await, Err(SessionError::Closed)));
        assert_eq!(incoming.next().await, None);
    }

    #[tokio::test]
    async fn test_drop_ends_stream() {
        let (mut session, _remote) = pair(&no_keepalive()).await;
        let mut incoming = session.incoming().unwrap();
        drop(session);
        assert_eq!(
            timeout(Duration::from_secs(2), incoming.next()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_oversized_datagram_dropped_whole() {
        let (mut session, remote) = pair(&no_keepalive()).await;
        let mut incoming = session.incoming().unwrap();
        let local = session.local_addr().unwrap();

        remote.send_to(&vec![b'x'; 4000], local).await.unwrap();
        remote.send_to(b"O-O", local).await.unwrap();

        let got = timeout(Duration::from_secs(2), incoming.next()).await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"O-O"[..]));
    }

    #[tokio::test]
    async fn test_oversized_send_rejected() {
        let (session, _remote) = pair(&no_keepalive()).await;
        let big = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(session.send(&big).await, Err(SessionError::TooLarge(_))));
    }
}
