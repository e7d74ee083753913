//! Connection negotiation
//!
//! One [`Negotiator`] drives one attempt to reach the other player:
//!
//! ```text
//! host:   Idle → ResolvingAddress → Registering → AwaitingPeer → Probing → Connected
//! joiner: Idle → ResolvingAddress → LookingUp ─────────────────→ Probing → Connected
//!                                   (any stage) ──────────────────────────→ Failed
//! ```
//!
//! Every stage races against cancellation and the overall deadline, so a
//! cancel is observed within one poll or probe interval. The single UDP socket
//! bound at the start is used for STUN, for probing and finally handed to the
//! [`Session`], which keeps the NAT mapping learned through STUN valid.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use chesslink_core::protocol::{Control, PROBE, PROBE_ACK};
use chesslink_core::{
    Config, ConnectionState, FailureReason, Identifier, PeerAddress, PollResponse, ProbeConfig,
    SessionToken, MAX_DATAGRAM_SIZE, RECV_BUFFER_SIZE,
};

use crate::rendezvous::{RendezvousClient, RendezvousError};
use crate::session::Session;
use crate::stun::{is_transient, StunResolver};

/// Registration is retried with a fresh token this many times on a collision
const MAX_TOKEN_REDRAWS: u32 = 3;

/// Which side of the rendezvous we are on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Joiner { identifier: Identifier },
}

/// Requests cancellation of a running negotiation
#[derive(Debug, Clone)]
pub struct Canceller(Arc<watch::Sender<bool>>);

impl Canceller {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Drives a single connection attempt
pub struct Negotiator {
    config: Config,
    role: Role,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<ConnectionState>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl Negotiator {
    /// Negotiate as the host: register a fresh token and wait for a joiner
    pub fn host(config: Config) -> Self {
        Self::new(config, Role::Host)
    }

    /// Negotiate as the joiner of the session named by `identifier`
    pub fn join(config: Config, identifier: Identifier) -> Self {
        Self::new(config, Role::Joiner { identifier })
    }

    fn new(config: Config, role: Role) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (event_tx, _) = broadcast::channel(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        Self {
            config,
            role,
            state_tx,
            event_tx,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state, for polling from a UI loop
    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Latest-value view of the state
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Every transition, in order
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.event_tx.subscribe()
    }

    pub fn canceller(&self) -> Canceller {
        Canceller(self.cancel_tx.clone())
    }

    /// Run the attempt to completion on the current task
    pub async fn run(self) -> Result<Session, FailureReason> {
        let deadline = Instant::now() + self.config.network.connect_timeout();
        let mut cancel = self.cancel_rx.clone();

        let outcome = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => Err(FailureReason::Cancelled),
            _ = sleep_until(deadline) => Err(FailureReason::DeadlineExceeded),
            result = self.drive() => result,
        };

        if let Err(reason) = outcome {
            warn!("Negotiation failed: {}", reason);
            self.set_state(ConnectionState::Failed { reason });
        }
        outcome
    }

    /// Run the attempt on a background task
    pub fn spawn(self) -> NegotiationHandle {
        let state = self.watch();
        let canceller = self.canceller();
        let task = tokio::spawn(self.run());

        NegotiationHandle {
            state,
            canceller,
            task: Some(task),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        info!("Negotiation state: {}", state);
        self.state_tx.send_replace(state.clone());
        let _ = self.event_tx.send(state);
    }

    async fn drive(&self) -> Result<Session, FailureReason> {
        let socket = UdpSocket::bind(self.config.network.bind_addr)
            .await
            .map_err(|e| {
                error!("Failed to bind {}: {}", self.config.network.bind_addr, e);
                FailureReason::ResolutionUnavailable
            })?;
        debug!("Bound negotiation socket {:?}", socket.local_addr());

        self.set_state(ConnectionState::ResolvingAddress);
        let public = StunResolver::new(&self.config.stun)
            .resolve(&socket)
            .await
            .map_err(|e| e.reason())?;

        let rendezvous =
            RendezvousClient::new(&self.config.rendezvous).map_err(|e| e.reason())?;

        let peer = match self.role {
            Role::Host => self.host_rendezvous(&rendezvous, public).await?,
            Role::Joiner { identifier } => {
                self.set_state(ConnectionState::LookingUp);
                rendezvous
                    .lookup(identifier.token(), public)
                    .await
                    .map_err(|e| e.reason())?
            }
        };

        self.set_state(ConnectionState::Probing { peer });
        let first = punch(&socket, peer, &self.config.probe).await?;

        self.set_state(ConnectionState::Connected { peer });
        Ok(Session::start(socket, peer, &self.config.session, first))
    }

    async fn host_rendezvous(
        &self,
        rendezvous: &RendezvousClient,
        public: PeerAddress,
    ) -> Result<PeerAddress, FailureReason> {
        self.set_state(ConnectionState::Registering);

        let mut redraws = 0;
        let token = loop {
            let token = SessionToken::generate().map_err(|e| {
                error!("Failed to draw a session token: {}", e);
                FailureReason::RendezvousUnreachable
            })?;
            match rendezvous.register(token, public).await {
                Ok(()) => break token,
                Err(RendezvousError::TokenTaken) if redraws < MAX_TOKEN_REDRAWS => {
                    redraws += 1;
                    warn!("Token {} already taken, drawing another", token);
                }
                Err(e) => {
                    warn!("Registration failed: {}", e);
                    return Err(e.reason());
                }
            }
        };

        let identifier = token.identifier();
        self.set_state(ConnectionState::AwaitingPeer { identifier });

        let wait = self.config.rendezvous.max_wait();
        tokio::time::timeout(wait, self.await_peer(rendezvous, token))
            .await
            .map_err(|_| {
                warn!("No peer joined {} within {:?}", identifier, wait);
                FailureReason::DeadlineExceeded
            })?
    }

    async fn await_peer(
        &self,
        rendezvous: &RendezvousClient,
        token: SessionToken,
    ) -> Result<PeerAddress, FailureReason> {
        let mut ticker = interval(self.config.rendezvous.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match rendezvous.poll_for_peer(token).await.map_err(|e| e.reason())? {
                PollResponse::Pending => debug!("Still waiting for a peer"),
                PollResponse::Found { address } => {
                    info!("Peer joined from {}", address);
                    return Ok(address);
                }
            }
        }
    }
}

/// Resolves once cancellation is requested; never if the canceller is gone
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let sender_gone = rx.wait_for(|cancelled| *cancelled).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

/// Send probes until the peer is heard from
///
/// Any datagram from the peer's address proves the path is open. We ack it so
/// a peer that is still probing stops too. An application datagram that
/// arrives here is returned so the session can deliver it.
async fn punch(
    socket: &UdpSocket,
    peer: PeerAddress,
    config: &ProbeConfig,
) -> Result<Option<Bytes>, FailureReason> {
    let mut ticker = interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent = 0u32;
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if sent >= config.max_attempts {
                    warn!("No response from {} after {} probes", peer, sent);
                    return Err(FailureReason::PeerUnreachable);
                }
                sent += 1;
                if let Err(e) = socket.send_to(PROBE, peer.socket_addr()).await {
                    debug!("Probe {} to {} failed: {}", sent, peer, e);
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) if peer.matches(from) => {
                    let datagram = &buf[..len];
                    debug!("Heard from {} after {} probes ({:?})", peer, sent, Control::parse(datagram));
                    if let Err(e) = socket.send_to(PROBE_ACK, peer.socket_addr()).await {
                        debug!("Failed to ack {}: {}", peer, e);
                    }
                    if len > MAX_DATAGRAM_SIZE {
                        warn!("Dropping oversized datagram ({} bytes) from {}", len, peer);
                        return Ok(None);
                    }
                    let first = Control::parse(datagram)
                        .is_none()
                        .then(|| Bytes::copy_from_slice(datagram));
                    return Ok(first);
                }
                Ok((_, from)) => debug!("Ignoring datagram from {} while probing", from),
                Err(e) if is_transient(&e) => debug!("Transient receive error: {}", e),
                Err(e) => {
                    warn!("Probe socket failed: {}", e);
                    return Err(FailureReason::PeerUnreachable);
                }
            },
        }
    }
}

/// A negotiation running on a background task
#[derive(Debug)]
pub struct NegotiationHandle {
    state: watch::Receiver<ConnectionState>,
    canceller: Canceller,
    task: Option<JoinHandle<Result<Session, FailureReason>>>,
}

impl NegotiationHandle {
    /// Current state; never blocks
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Take the outcome if the attempt has ended, without waiting
    pub fn try_finish(&mut self) -> Option<Result<Session, FailureReason>> {
        let task = self.task.as_mut()?;
        if !task.is_finished() {
            return None;
        }
        let joined = task.now_or_never()?;
        self.task = None;
        Some(join_outcome(joined))
    }

    /// Wait for the attempt to end
    pub async fn finish(mut self) -> Result<Session, FailureReason> {
        match self.task.take() {
            Some(task) => join_outcome(task.await),
            None => Err(FailureReason::Cancelled),
        }
    }
}

impl Drop for NegotiationHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.canceller.cancel();
        }
    }
}

fn join_outcome(
    joined: Result<Result<Session, FailureReason>, tokio::task::JoinError>,
) -> Result<Session, FailureReason> {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(FailureReason::Cancelled),
    }
}
