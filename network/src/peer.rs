//! Peer connections: the `CONNECTING -> HANDSHAKING -> READY -> DISCONNECTED`
//! state machine, per-peer reader/writer tasks, ban scoring, and rate
//! limiting.
//!
//! Each peer gets one reader task (socket -> decoded `Message` -> event sent
//! to the node's central dispatcher) and one writer task (bounded outbound
//! queue -> socket). Neither task touches the blockchain-state or mempool
//! locks directly; all validation happens in the dispatcher that owns those
//! locks, reached only via `PeerEvent`s sent over an `mpsc` channel.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};

use crate::message::{Message, MessageError, HEADER_LEN};

pub const MAX_REQUESTS_PER_MINUTE: u32 = 60;
pub const BAN_SCORE_INVALID_BLOCK: u32 = 100;
pub const BAN_SCORE_INVALID_TX: u32 = 10;
pub const BAN_SCORE_OVERSIZED_MESSAGE: u32 = 50;
pub const BAN_SCORE_TOO_MANY_MESSAGES: u32 = 20;
pub const BAN_THRESHOLD: u32 = 100;
pub const BAN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
pub const MAX_INBOUND_PER_IP: usize = 3;
pub const MAX_PEERS: usize = 125;
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PING_TIMEOUT: Duration = Duration::from_secs(30);
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] MessageError),
    #[error("peer {0} is banned")]
    Banned(IpAddr),
    #[error("peer limit reached")]
    TooManyPeers,
    #[error("peer {0} is not connected")]
    NotConnected(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Ready,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub inbound: bool,
    pub state: PeerState,
    pub version: u32,
    pub services: u64,
    pub start_height: u64,
    pub user_agent: String,
    pub connected_at: u64,
    pub ban_score: u32,
}

/// Events a reader task (or the listener, or a timeout sweep) hands to the
/// node's central dispatcher. The dispatcher is the only place blockchain
/// and mempool locks are taken on the network's behalf.
#[derive(Debug)]
pub enum PeerEvent {
    Connected { addr: SocketAddr, inbound: bool },
    Message { addr: SocketAddr, message: Message },
    Disconnected { addr: SocketAddr },
}

/// A simple token bucket: `MAX_REQUESTS_PER_MINUTE` tokens refilled
/// continuously, one request consuming one token.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32) -> Self {
        TokenBucket { tokens: capacity as f64, capacity: capacity as f64, refill_per_sec: capacity as f64 / 60.0, last_refill: Instant::now() }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// A bounded outbound message queue with the node's backpressure policy:
/// pushing an INV when full drops the oldest queued item; pushing a BLOCK or
/// TX waits for room instead of dropping anything in flight.
struct OutboundQueue {
    items: Mutex<VecDeque<Message>>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        OutboundQueue { items: Mutex::new(VecDeque::new()), capacity, notify: Notify::new() }
    }

    async fn push_drop_oldest(&self, msg: Message) {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            items.pop_front();
        }
        items.push_back(msg);
        self.notify.notify_one();
    }

    async fn push_backpressure(&self, msg: Message) {
        loop {
            {
                let mut items = self.items.lock().await;
                if items.len() < self.capacity {
                    items.push_back(msg);
                    self.notify.notify_one();
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn pop(&self) -> Message {
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(msg) = items.pop_front() {
                    return msg;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Everything the peer manager keeps about a live connection.
struct PeerHandle {
    info: RwLock<PeerInfo>,
    ban_score: AtomicU32,
    last_activity: AtomicU64,
    outbound: Arc<OutboundQueue>,
}

/// Registry of connected peers: connection lifecycle, ban scoring, rate
/// limiting, and the bounded outbound queues the writer tasks drain.
pub struct PeerManager {
    peers: RwLock<HashMap<SocketAddr, Arc<PeerHandle>>>,
    inbound_counts: RwLock<HashMap<IpAddr, usize>>,
    banned: RwLock<HashMap<IpAddr, Instant>>,
    events_tx: mpsc::Sender<PeerEvent>,
}

impl PeerManager {
    pub fn new(events_tx: mpsc::Sender<PeerEvent>) -> Self {
        PeerManager {
            peers: RwLock::new(HashMap::new()),
            inbound_counts: RwLock::new(HashMap::new()),
            banned: RwLock::new(HashMap::new()),
            events_tx,
        }
    }

    pub async fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.read().await.get(&ip).map(|until| Instant::now() < *until).unwrap_or(false)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn connected_peers(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        let mut out = Vec::with_capacity(peers.len());
        for handle in peers.values() {
            out.push(handle.info.read().await.clone());
        }
        out
    }

    pub async fn ready_peers(&self) -> Vec<SocketAddr> {
        let peers = self.peers.read().await;
        let mut out = Vec::new();
        for (addr, handle) in peers.iter() {
            if handle.info.read().await.state == PeerState::Ready {
                out.push(*addr);
            }
        }
        out
    }

    /// Establishes an outbound TCP connection and registers it as a peer.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<(), PeerError> {
        if self.is_banned(addr.ip()).await {
            return Err(PeerError::Banned(addr.ip()));
        }
        if self.peer_count().await >= MAX_PEERS {
            return Err(PeerError::TooManyPeers);
        }
        let stream = TcpStream::connect(addr).await?;
        self.register(stream, addr, false).await
    }

    /// Registers an already-accepted inbound connection, enforcing the
    /// per-IP and total peer caps.
    pub async fn accept(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<(), PeerError> {
        if self.is_banned(addr.ip()).await {
            return Err(PeerError::Banned(addr.ip()));
        }
        if self.peer_count().await >= MAX_PEERS {
            return Err(PeerError::TooManyPeers);
        }
        {
            let mut counts = self.inbound_counts.write().await;
            let count = counts.entry(addr.ip()).or_insert(0);
            if *count >= MAX_INBOUND_PER_IP {
                return Err(PeerError::TooManyPeers);
            }
            *count += 1;
        }
        self.register(stream, addr, true).await
    }

    async fn register(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, inbound: bool) -> Result<(), PeerError> {
        stream.set_nodelay(true).ok();
        let (mut read_half, mut write_half) = stream.into_split();

        let outbound = Arc::new(OutboundQueue::new(OUTBOUND_QUEUE_CAPACITY));
        let handle = Arc::new(PeerHandle {
            info: RwLock::new(PeerInfo {
                addr,
                inbound,
                state: PeerState::Connecting,
                version: 0,
                services: 0,
                start_height: 0,
                user_agent: String::new(),
                connected_at: emberchain_core::current_timestamp(),
                ban_score: 0,
            }),
            ban_score: AtomicU32::new(0),
            last_activity: AtomicU64::new(emberchain_core::current_timestamp()),
            outbound: outbound.clone(),
        });

        self.peers.write().await.insert(addr, handle.clone());
        info!("peer {addr}: connected (inbound={inbound})");
        let _ = self.events_tx.send(PeerEvent::Connected { addr, inbound }).await;

        let writer_handle = handle.clone();
        tokio::spawn(async move {
            loop {
                let msg = writer_handle.outbound.pop().await;
                let frame = msg.to_frame();
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        let this = Arc::clone(self);
        let reader_handle = handle.clone();
        tokio::spawn(async move {
            let mut bucket = TokenBucket::new(MAX_REQUESTS_PER_MINUTE);
            loop {
                let mut header = [0u8; HEADER_LEN];
                if read_half.read_exact(&mut header).await.is_err() {
                    break;
                }
                let (msg_type, payload_len, checksum) = match Message::parse_header(&header) {
                    Ok(parsed) => parsed,
                    Err(_) => {
                        this.bump_ban_score(addr, BAN_SCORE_OVERSIZED_MESSAGE).await;
                        break;
                    }
                };
                let mut payload = vec![0u8; payload_len as usize];
                if read_half.read_exact(&mut payload).await.is_err() {
                    break;
                }
                if Message::verify_checksum(&payload, &checksum).is_err() {
                    this.bump_ban_score(addr, BAN_SCORE_OVERSIZED_MESSAGE).await;
                    break;
                }

                reader_handle.last_activity.store(emberchain_core::current_timestamp(), Ordering::Relaxed);
                if !bucket.try_consume() {
                    this.bump_ban_score(addr, BAN_SCORE_TOO_MANY_MESSAGES).await;
                    continue;
                }

                let message = Message { msg_type, payload };
                if this.events_tx.send(PeerEvent::Message { addr, message }).await.is_err() {
                    break;
                }
            }
            this.remove(addr).await;
        });

        Ok(())
    }

    pub async fn set_state(&self, addr: SocketAddr, state: PeerState) {
        if let Some(handle) = self.peers.read().await.get(&addr) {
            handle.info.write().await.state = state;
        }
    }

    pub async fn record_version(&self, addr: SocketAddr, version: u32, services: u64, start_height: u64, user_agent: String) {
        if let Some(handle) = self.peers.read().await.get(&addr) {
            let mut info = handle.info.write().await;
            info.version = version;
            info.services = services;
            info.start_height = start_height;
            info.user_agent = user_agent;
        }
    }

    pub async fn state_of(&self, addr: SocketAddr) -> Option<PeerState> {
        let handle = self.peers.read().await.get(&addr)?.clone();
        Some(handle.info.read().await.state)
    }

    /// Sends an INV message, dropping the oldest queued INV if the outbound
    /// queue is saturated.
    pub async fn send_inv(&self, addr: SocketAddr, msg: Message) {
        if let Some(handle) = self.peers.read().await.get(&addr).cloned() {
            handle.outbound.push_drop_oldest(msg).await;
        }
    }

    /// Sends any other message kind, blocking (without holding any lock)
    /// until the outbound queue has room rather than dropping it.
    pub async fn send(&self, addr: SocketAddr, msg: Message) {
        if let Some(handle) = self.peers.read().await.get(&addr).cloned() {
            handle.outbound.push_backpressure(msg).await;
        }
    }

    pub async fn broadcast_inv(&self, msg: Message, exclude: Option<SocketAddr>) {
        let addrs: Vec<SocketAddr> = self.ready_peers().await;
        for addr in addrs {
            if Some(addr) != exclude {
                self.send_inv(addr, msg.clone()).await;
            }
        }
    }

    /// Raises a peer's ban score; disconnects and blacklists the peer's IP
    /// once the score reaches `BAN_THRESHOLD`.
    pub async fn bump_ban_score(self: &Arc<Self>, addr: SocketAddr, delta: u32) {
        let Some(handle) = self.peers.read().await.get(&addr).cloned() else { return };
        let new_score = handle.ban_score.fetch_add(delta, Ordering::Relaxed) + delta;
        handle.info.write().await.ban_score = new_score;
        warn!("peer {addr}: ban score +{delta} = {new_score}");
        if new_score >= BAN_THRESHOLD {
            self.ban(addr).await;
        }
    }

    /// Disconnects `addr` and blacklists its IP for `BAN_DURATION`, lifting
    /// the ban automatically via a delayed unban task.
    pub async fn ban(self: &Arc<Self>, addr: SocketAddr) {
        let ip = addr.ip();
        warn!("peer {addr}: ban score threshold reached, disconnecting and banning {ip} for {:?}", BAN_DURATION);
        self.remove(addr).await;
        self.banned.write().await.insert(ip, Instant::now() + BAN_DURATION);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(BAN_DURATION).await;
            this.banned.write().await.remove(&ip);
            debug!("unbanned {ip}");
        });
    }

    pub async fn remove(&self, addr: SocketAddr) {
        if self.peers.write().await.remove(&addr).is_some() {
            let mut counts = self.inbound_counts.write().await;
            if let Some(count) = counts.get_mut(&addr.ip()) {
                *count = count.saturating_sub(1);
            }
            info!("peer {addr}: disconnected");
            let _ = self.events_tx.send(PeerEvent::Disconnected { addr }).await;
        }
    }

    /// Disconnects every peer that hasn't sent a message within
    /// `PING_INTERVAL + PING_TIMEOUT`.
    pub async fn sweep_idle_peers(&self) -> Vec<SocketAddr> {
        let deadline = emberchain_core::current_timestamp().saturating_sub((PING_INTERVAL + PING_TIMEOUT).as_secs());
        let peers = self.peers.read().await;
        peers
            .iter()
            .filter(|(_, handle)| handle.last_activity.load(Ordering::Relaxed) < deadline)
            .map(|(addr, _)| *addr)
            .collect()
    }
}
