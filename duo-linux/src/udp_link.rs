//! Short-range link emulated over UDP.
//!
//! Datagram layout: kind (1) | src mac (6) | dst mac (6) | seq (4, LE) | body.
//! `DATA` bodies are sealed with the per-peer link key; the receiver answers every
//! `DATA` addressed to it with a bodiless `LINK_ACK` before decrypting, the way the
//! radio's MAC layer acknowledges frames it heard. That ack is what drives
//! `delivered` in the send-done event.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use duo_core::wire::MAX_FRAME_LEN;
use duo_core::{Key, LinkError, LinkEvents, MacAddress, PeerInfo, PeerLink};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::crypto;

const KIND_DATA: u8 = 0x01;
const KIND_LINK_ACK: u8 = 0x02;
const HEADER_LEN: usize = 17;

/// Peer table capacity of the real radio.
pub const MAX_PEERS: usize = 20;

/// How long a sender waits for the link-level ack before reporting failure.
const LINK_ACK_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LinkHeader {
    kind: u8,
    src: MacAddress,
    dst: MacAddress,
    seq: u32,
}

impl LinkHeader {
    fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.kind;
        out[1..7].copy_from_slice(self.src.as_bytes());
        out[7..13].copy_from_slice(self.dst.as_bytes());
        out[13..17].copy_from_slice(&self.seq.to_le_bytes());
        out
    }

    fn parse(bytes: &[u8]) -> Option<(Self, &[u8])> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let mac = |range: std::ops::Range<usize>| -> Option<MacAddress> {
            let arr: [u8; 6] = bytes[range].try_into().ok()?;
            Some(MacAddress::from(arr))
        };
        let header = LinkHeader {
            kind: bytes[0],
            src: mac(1..7)?,
            dst: mac(7..13)?,
            seq: u32::from_le_bytes(bytes[13..17].try_into().ok()?),
        };
        Some((header, &bytes[HEADER_LEN..]))
    }
}

#[derive(Debug)]
struct PeerTable {
    initialized: bool,
    primary_key: Key,
    peers: Vec<PeerInfo>,
}

impl PeerTable {
    fn link_key(&self, me: &MacAddress, peer: &MacAddress) -> Option<[u8; 32]> {
        self.peers
            .iter()
            .find(|p| p.address == *peer)
            .map(|p| crypto::derive_link_key(&self.primary_key, &p.local_key, me, peer))
    }
}

#[derive(Debug)]
struct LinkState {
    me: MacAddress,
    table: Mutex<PeerTable>,
    events: Mutex<Option<LinkEvents>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    next_seq: AtomicU32,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl LinkState {
    fn events(&self) -> Option<LinkEvents> {
        lock(&self.events).clone()
    }
}

/// [`PeerLink`] over a UDP socket. All traffic goes to `remote`, the paired host.
pub struct UdpPeerLink {
    handle: Handle,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    state: Arc<LinkState>,
    recv_task: Option<JoinHandle<()>>,
}

impl UdpPeerLink {
    pub fn new(handle: Handle, socket: UdpSocket, remote: SocketAddr, me: MacAddress) -> Self {
        Self {
            handle,
            socket: Arc::new(socket),
            remote,
            state: Arc::new(LinkState {
                me,
                table: Mutex::new(PeerTable {
                    initialized: false,
                    primary_key: Key::default(),
                    peers: Vec::new(),
                }),
                events: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_seq: AtomicU32::new(1),
            }),
            recv_task: None,
        }
    }
}

impl Drop for UdpPeerLink {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }
}

impl PeerLink for UdpPeerLink {
    fn init(&mut self) -> Result<(), LinkError> {
        if self.recv_task.is_some() {
            return Ok(());
        }
        let socket = self.socket.clone();
        let state = self.state.clone();
        self.recv_task = Some(self.handle.spawn(recv_loop(socket, state)));
        lock(&self.state.table).initialized = true;
        debug!(me = %self.state.me, remote = %self.remote, "udp link up");
        Ok(())
    }

    fn set_primary_key(&mut self, key: &Key) -> Result<(), LinkError> {
        lock(&self.state.table).primary_key = *key;
        Ok(())
    }

    fn peers(&self) -> Result<Vec<MacAddress>, LinkError> {
        let table = lock(&self.state.table);
        if !table.initialized {
            return Err(LinkError::NotInitialized);
        }
        Ok(table.peers.iter().map(|p| p.address).collect())
    }

    fn add_peer(&mut self, peer: &PeerInfo) -> Result<(), LinkError> {
        let mut table = lock(&self.state.table);
        if table.peers.iter().any(|p| p.address == peer.address) {
            return Err(LinkError::Driver(format!("peer {} already exists", peer.address)));
        }
        if table.peers.len() >= MAX_PEERS {
            return Err(LinkError::PeerTableFull);
        }
        table.peers.push(peer.clone());
        Ok(())
    }

    fn delete_peer(&mut self, address: &MacAddress) -> Result<(), LinkError> {
        let mut table = lock(&self.state.table);
        let before = table.peers.len();
        table.peers.retain(|p| p.address != *address);
        if table.peers.len() == before {
            return Err(LinkError::PeerNotFound(*address));
        }
        Ok(())
    }

    fn peer_exists(&self, address: &MacAddress) -> bool {
        lock(&self.state.table)
            .peers
            .iter()
            .any(|p| p.address == *address)
    }

    fn send(&mut self, to: &MacAddress, frame: &[u8]) -> Result<(), LinkError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(LinkError::TooLarge(frame.len()));
        }
        let key = {
            let table = lock(&self.state.table);
            if !table.initialized {
                return Err(LinkError::NotInitialized);
            }
            table
                .link_key(&self.state.me, to)
                .ok_or(LinkError::PeerNotFound(*to))?
        };
        let header = LinkHeader {
            kind: KIND_DATA,
            src: self.state.me,
            dst: *to,
            seq: self.state.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let header_bytes = header.to_bytes();
        let body = crypto::seal(&key, &header_bytes, frame)
            .map_err(|e| LinkError::Driver(e.to_string()))?;
        let mut datagram = Vec::with_capacity(HEADER_LEN + body.len());
        datagram.extend_from_slice(&header_bytes);
        datagram.extend_from_slice(&body);

        self.handle.spawn(send_task(
            self.socket.clone(),
            self.state.clone(),
            self.remote,
            header,
            datagram,
        ));
        Ok(())
    }

    fn register(&mut self, events: LinkEvents) {
        *lock(&self.state.events) = Some(events);
    }
}

/// Transmit one frame and report the link-level outcome through the send-done event.
async fn send_task(
    socket: Arc<UdpSocket>,
    state: Arc<LinkState>,
    remote: SocketAddr,
    header: LinkHeader,
    datagram: Vec<u8>,
) {
    let (tx, rx) = oneshot::channel();
    lock(&state.pending).insert(header.seq, tx);

    let delivered = match socket.send_to(&datagram, remote).await {
        Ok(_) => tokio::time::timeout(LINK_ACK_TIMEOUT, rx).await.is_ok_and(|r| r.is_ok()),
        Err(e) => {
            debug!(error = %e, "udp send failed");
            false
        }
    };
    lock(&state.pending).remove(&header.seq);
    trace!(seq = header.seq, delivered, "link send done");

    if let Some(events) = state.events() {
        events.on_data_sent(&header.dst, delivered);
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, state: Arc<LinkState>) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                // ICMP refusals from earlier sends surface here; not fatal.
                trace!(error = %e, "udp recv error");
                continue;
            }
        };
        let Some((header, body)) = LinkHeader::parse(&buf[..n]) else {
            debug!(%from, len = n, "runt datagram, ignoring");
            continue;
        };
        if header.dst != state.me && header.dst != MacAddress::BROADCAST {
            continue;
        }
        match header.kind {
            KIND_LINK_ACK => {
                if let Some(tx) = lock(&state.pending).remove(&header.seq) {
                    let _ = tx.send(());
                }
            }
            KIND_DATA => {
                let ack = LinkHeader {
                    kind: KIND_LINK_ACK,
                    src: state.me,
                    dst: header.src,
                    seq: header.seq,
                };
                if let Err(e) = socket.send_to(&ack.to_bytes(), from).await {
                    debug!(error = %e, "failed to send link ack");
                }

                let key = lock(&state.table).link_key(&state.me, &header.src);
                let Some(key) = key else {
                    debug!(src = %header.src, "frame from device not in peer table");
                    continue;
                };
                let frame = match crypto::open(&key, &buf[..HEADER_LEN], body) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(src = %header.src, error = %e, "undecryptable frame (key mismatch?)");
                        continue;
                    }
                };
                if let Some(events) = state.events() {
                    events.on_data_received(&header.src, &frame);
                }
            }
            other => debug!(kind = other, "unknown link datagram kind"),
        }
    }
}
