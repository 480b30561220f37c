//! Long-range reliable-datagram manager emulated over UDP.
//!
//! Datagram layout: to (1) | from (1) | id (1) | flags (1) | sealed payload.
//! Unicast datagrams are acknowledged with the same id and [`FLAG_ACK`]; a sender
//! retransmits until acked or out of retries. Broadcasts are sent once and never acked.
//! The tuned frequency is bound into the AEAD associated data, so radios on different
//! frequencies cannot hear each other.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use duo_core::{Datagram, Key, LinkError, LoraAddress, ReliableDatagram};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::crypto;

pub const FLAG_ACK: u8 = 0x80;
const HEADER_LEN: usize = 4;

/// Band limits of the emulated transceiver.
const FREQUENCY_RANGE_MHZ: std::ops::RangeInclusive<f32> = 137.0..=1020.0;
const TX_POWER_RANGE_DBM: std::ops::RangeInclusive<i8> = 5..=23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RadioHeader {
    to: LoraAddress,
    from: LoraAddress,
    id: u8,
    flags: u8,
}

impl RadioHeader {
    fn to_bytes(self) -> [u8; HEADER_LEN] {
        [self.to.0, self.from.0, self.id, self.flags]
    }

    fn parse(bytes: &[u8]) -> Option<(Self, &[u8])> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let header = RadioHeader {
            to: LoraAddress(bytes[0]),
            from: LoraAddress(bytes[1]),
            id: bytes[2],
            flags: bytes[3],
        };
        Some((header, &bytes[HEADER_LEN..]))
    }

    fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }
}

#[derive(Debug)]
struct Received {
    header: RadioHeader,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct RadioState {
    key: Mutex<[u8; 32]>,
    frequency_khz: AtomicU32,
    inbound: Mutex<VecDeque<Received>>,
}

impl RadioState {
    fn aad(&self, header: &[u8]) -> [u8; HEADER_LEN + 4] {
        let mut aad = [0u8; HEADER_LEN + 4];
        aad[..HEADER_LEN].copy_from_slice(&header[..HEADER_LEN]);
        aad[HEADER_LEN..].copy_from_slice(&self.frequency_khz.load(Ordering::Relaxed).to_le_bytes());
        aad
    }
}

fn to_khz(mhz: f32) -> u32 {
    (mhz * 1000.0).round() as u32
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Remembers the last id seen from each source so retransmissions are not delivered twice.
#[derive(Debug)]
struct SeenIds([Option<u8>; 256]);

impl SeenIds {
    /// Record `id` from `from`; false if it repeats the previous one.
    fn check_and_record(&mut self, from: LoraAddress, id: u8) -> bool {
        let slot = &mut self.0[from.0 as usize];
        if *slot == Some(id) {
            return false;
        }
        *slot = Some(id);
        true
    }
}

/// [`ReliableDatagram`] over a UDP socket. All traffic goes to `remote`.
pub struct UdpDatagramManager {
    handle: Handle,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    state: Arc<RadioState>,
    acks_tx: mpsc::UnboundedSender<(LoraAddress, u8)>,
    acks: mpsc::UnboundedReceiver<(LoraAddress, u8)>,
    recv_task: Option<JoinHandle<()>>,
    this_address: LoraAddress,
    tx_power_dbm: i8,
    retries: u8,
    timeout: Duration,
    last_id: u8,
    seen: SeenIds,
}

impl UdpDatagramManager {
    pub fn new(handle: Handle, socket: UdpSocket, remote: SocketAddr) -> Self {
        let (acks_tx, acks) = mpsc::unbounded_channel();
        Self {
            handle,
            socket: Arc::new(socket),
            remote,
            state: Arc::new(RadioState {
                key: Mutex::new(crypto::derive_radio_key(&Key::default())),
                frequency_khz: AtomicU32::new(to_khz(915.0)),
                inbound: Mutex::new(VecDeque::new()),
            }),
            acks_tx,
            acks,
            recv_task: None,
            this_address: LoraAddress::BROADCAST,
            tx_power_dbm: 13,
            retries: 3,
            timeout: Duration::from_millis(200),
            last_id: 0,
            seen: SeenIds([None; 256]),
        }
    }

    fn transmit(&self, header: RadioHeader, payload: &[u8]) -> bool {
        let header_bytes = header.to_bytes();
        let key = *lock(&self.state.key);
        let body = match crypto::seal(&key, &self.state.aad(&header_bytes), payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to seal datagram");
                return false;
            }
        };
        let mut datagram = Vec::with_capacity(HEADER_LEN + body.len());
        datagram.extend_from_slice(&header_bytes);
        datagram.extend_from_slice(&body);

        let socket = self.socket.clone();
        let remote = self.remote;
        match self.handle.block_on(async move { socket.send_to(&datagram, remote).await }) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "udp send failed");
                false
            }
        }
    }

    fn wait_for_ack(&mut self, from: LoraAddress, id: u8) -> bool {
        let timeout = self.timeout;
        let acks = &mut self.acks;
        self.handle.block_on(async {
            tokio::time::timeout(timeout, async {
                while let Some((ack_from, ack_id)) = acks.recv().await {
                    if ack_from == from && ack_id == id {
                        return true;
                    }
                    trace!(%ack_from, ack_id, "stale ack");
                }
                false
            })
            .await
            .unwrap_or(false)
        })
    }
}

impl Drop for UdpDatagramManager {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }
}

impl ReliableDatagram for UdpDatagramManager {
    fn init(&mut self) -> Result<(), LinkError> {
        if self.recv_task.is_none() {
            self.recv_task = Some(self.handle.spawn(recv_loop(
                self.socket.clone(),
                self.state.clone(),
                self.acks_tx.clone(),
            )));
            debug!(remote = %self.remote, "udp radio up");
        }
        Ok(())
    }

    fn set_frequency(&mut self, mhz: f32) -> Result<(), LinkError> {
        if !FREQUENCY_RANGE_MHZ.contains(&mhz) {
            return Err(LinkError::Driver(format!("{mhz} MHz out of range")));
        }
        self.state.frequency_khz.store(to_khz(mhz), Ordering::Relaxed);
        debug!(mhz, "frequency set");
        Ok(())
    }

    fn set_tx_power(&mut self, dbm: i8) {
        self.tx_power_dbm = dbm.clamp(*TX_POWER_RANGE_DBM.start(), *TX_POWER_RANGE_DBM.end());
        debug!(dbm = self.tx_power_dbm, "tx power set");
    }

    fn set_retries(&mut self, retries: u8) {
        self.retries = retries;
    }

    fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout = Duration::from_millis(timeout_ms);
    }

    fn set_key(&mut self, key: &Key) {
        *lock(&self.state.key) = crypto::derive_radio_key(key);
    }

    fn this_address(&self) -> LoraAddress {
        self.this_address
    }

    fn set_this_address(&mut self, address: LoraAddress) {
        self.this_address = address;
    }

    fn available(&mut self) -> bool {
        !lock(&self.state.inbound).is_empty()
    }

    fn recv_from_ack(&mut self, buf: &mut [u8]) -> Option<Datagram> {
        loop {
            let received = lock(&self.state.inbound).pop_front()?;
            let header = received.header;
            if header.to != self.this_address && !header.to.is_broadcast() {
                continue;
            }
            if !header.to.is_broadcast() {
                // Ack before the duplicate check so a lost ack is repaired by the retry.
                let ack = RadioHeader {
                    to: header.from,
                    from: self.this_address,
                    id: header.id,
                    flags: FLAG_ACK,
                };
                self.transmit(ack, &[]);
                if !self.seen.check_and_record(header.from, header.id) {
                    debug!(from = %header.from, id = header.id, "duplicate datagram, re-acked");
                    continue;
                }
            }
            let len = received.payload.len().min(buf.len());
            buf[..len].copy_from_slice(&received.payload[..len]);
            return Some(Datagram {
                from: header.from,
                to: header.to,
                len,
            });
        }
    }

    fn send_to_wait(&mut self, payload: &[u8], to: LoraAddress) -> bool {
        self.last_id = self.last_id.wrapping_add(1);
        let header = RadioHeader {
            to,
            from: self.this_address,
            id: self.last_id,
            flags: 0,
        };
        if to.is_broadcast() {
            return self.transmit(header, payload);
        }

        while self.acks.try_recv().is_ok() {}
        for attempt in 0..=self.retries {
            trace!(attempt, id = header.id, %to, "transmit");
            if !self.transmit(header, payload) {
                continue;
            }
            if self.wait_for_ack(to, header.id) {
                return true;
            }
        }
        debug!(id = header.id, %to, retries = self.retries, "no ack");
        false
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    state: Arc<RadioState>,
    acks: mpsc::UnboundedSender<(LoraAddress, u8)>,
) {
    let mut buf = vec![0u8; 1024];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                trace!(error = %e, "udp recv error");
                continue;
            }
        };
        let Some((header, body)) = RadioHeader::parse(&buf[..n]) else {
            debug!(%from, len = n, "runt datagram, ignoring");
            continue;
        };
        let key = *lock(&state.key);
        let payload = match crypto::open(&key, &state.aad(&buf[..HEADER_LEN]), body) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "undecryptable datagram (key mismatch?)");
                continue;
            }
        };
        if header.is_ack() {
            let _ = acks.send((header.from, header.id));
        } else {
            lock(&state.inbound).push_back(Received { header, payload });
        }
    }
}
