//! In-memory radios and a manual clock for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::address::{LoraAddress, MacAddress};
use crate::clock::Clock;
use crate::espnow::{LinkEvents, PeerInfo, PeerLink};
use crate::lora::{Datagram, ReliableDatagram};
use crate::settings::Key;
use crate::transport::LinkError;

/// Time only moves when someone yields.
pub struct ManualClock {
    now: AtomicU64,
    step_ms: u64,
    on_yield: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

impl ManualClock {
    pub fn new(step_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(0),
            step_ms,
            on_yield: Mutex::new(None),
        })
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Run `hook` on every yield, e.g. to pump the other side of a pair.
    pub fn set_on_yield(&self, hook: impl FnMut() + Send + 'static) {
        *self.on_yield.lock().unwrap() = Some(Box::new(hook));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn yield_now(&self) {
        self.advance(self.step_ms);
        // Re-entrant yields (the hook itself yielding) skip the hook.
        if let Ok(mut hook) = self.on_yield.try_lock() {
            if let Some(hook) = hook.as_mut() {
                hook();
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SentFrame {
    pub to: MacAddress,
    pub bytes: Vec<u8>,
    pub at_ms: u64,
}

#[derive(Default)]
pub struct SimLinkState {
    pub me: MacAddress,
    pub initialized: bool,
    pub primary_key: Option<Key>,
    pub primary_key_sets: usize,
    pub peers: Vec<PeerInfo>,
    pub deleted: Vec<MacAddress>,
    pub sent: Vec<SentFrame>,
    pub events: Option<LinkEvents>,
    pub remote: Option<Arc<Mutex<SimLinkState>>>,
    /// `send` returns an error immediately.
    pub reject_sends: bool,
    /// Report link-level success but never deliver.
    pub black_hole: bool,
    /// Swallow this many outbound frames after reporting success.
    pub drop_next: usize,
    pub fail_init: bool,
    pub fail_primary_key: bool,
    pub fail_add_peer: bool,
    /// Deliver events from a spawned thread after this delay instead of inside `send`.
    pub event_delay: Option<Duration>,
}

/// Short-range link double. Delivery and send-done events are synchronous unless
/// `event_delay` is set, in which case they land from another thread.
#[derive(Clone)]
pub struct SimLink {
    pub state: Arc<Mutex<SimLinkState>>,
    clock: Arc<ManualClock>,
}

impl SimLink {
    pub fn new(me: MacAddress, clock: Arc<ManualClock>) -> Self {
        let state = SimLinkState {
            me,
            ..SimLinkState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            clock,
        }
    }

    /// Wire two links to each other.
    pub fn connect(a: &SimLink, b: &SimLink) {
        a.state.lock().unwrap().remote = Some(b.state.clone());
        b.state.lock().unwrap().remote = Some(a.state.clone());
    }

    pub fn events(&self) -> LinkEvents {
        self.state
            .lock()
            .unwrap()
            .events
            .clone()
            .expect("engine registered")
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_of_type(&self, tag: u8) -> Vec<SentFrame> {
        self.sent()
            .into_iter()
            .filter(|f| f.bytes.first() == Some(&tag))
            .collect()
    }
}

impl PeerLink for SimLink {
    fn init(&mut self) -> Result<(), LinkError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_init {
            return Err(LinkError::Driver("init".into()));
        }
        s.initialized = true;
        Ok(())
    }

    fn set_primary_key(&mut self, key: &Key) -> Result<(), LinkError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_primary_key {
            return Err(LinkError::Driver("pmk".into()));
        }
        s.primary_key = Some(*key);
        s.primary_key_sets += 1;
        Ok(())
    }

    fn peers(&self) -> Result<Vec<MacAddress>, LinkError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .peers
            .iter()
            .map(|p| p.address)
            .collect())
    }

    fn add_peer(&mut self, peer: &PeerInfo) -> Result<(), LinkError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_add_peer {
            return Err(LinkError::PeerTableFull);
        }
        s.peers.push(peer.clone());
        Ok(())
    }

    fn delete_peer(&mut self, address: &MacAddress) -> Result<(), LinkError> {
        let mut s = self.state.lock().unwrap();
        let before = s.peers.len();
        s.peers.retain(|p| p.address != *address);
        if s.peers.len() == before {
            return Err(LinkError::PeerNotFound(*address));
        }
        s.deleted.push(*address);
        Ok(())
    }

    fn peer_exists(&self, address: &MacAddress) -> bool {
        self.state
            .lock()
            .unwrap()
            .peers
            .iter()
            .any(|p| p.address == *address)
    }

    fn send(&mut self, to: &MacAddress, frame: &[u8]) -> Result<(), LinkError> {
        let (me, events, remote, swallow, black_hole, delay) = {
            let mut s = self.state.lock().unwrap();
            if s.reject_sends {
                return Err(LinkError::Driver("send".into()));
            }
            s.sent.push(SentFrame {
                to: *to,
                bytes: frame.to_vec(),
                at_ms: self.clock.now_ms(),
            });
            let swallow = s.drop_next > 0;
            if swallow {
                s.drop_next -= 1;
            }
            (s.me, s.events.clone(), s.remote.clone(), swallow, s.black_hole, s.event_delay)
        };
        // Never hold both ends' locks at once; the other end may be sending too.
        let remote = remote.filter(|r| r.lock().unwrap().me == *to);
        let delivered = black_hole || remote.is_some();
        let forward = !swallow && !black_hole;
        let to = *to;
        let frame = frame.to_vec();
        let complete = move || {
            if forward {
                if let Some(remote) = remote {
                    let remote_events = remote.lock().unwrap().events.clone();
                    if let Some(remote_events) = remote_events {
                        remote_events.on_data_received(&me, &frame);
                    }
                }
            }
            if let Some(events) = events {
                events.on_data_sent(&to, delivered);
            }
        };
        match delay {
            Some(delay) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    complete();
                });
            }
            None => complete(),
        }
        Ok(())
    }

    fn register(&mut self, events: LinkEvents) {
        self.state.lock().unwrap().events = Some(events);
    }
}

#[derive(Debug, Clone)]
pub struct SimDatagram {
    pub from: LoraAddress,
    pub to: LoraAddress,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub struct SimManagerState {
    pub this_address: Option<LoraAddress>,
    pub initialized: bool,
    pub frequency_mhz: f32,
    pub tx_power_dbm: i8,
    pub retries: u8,
    pub timeout_ms: u64,
    pub key: Option<Key>,
    pub inbound: VecDeque<SimDatagram>,
    pub sent: Vec<(LoraAddress, Vec<u8>)>,
    pub acked: bool,
    pub fail_init: bool,
    /// Report this length from `recv_from_ack` instead of the bytes copied.
    pub reported_len: Option<usize>,
}

/// Reliable-datagram manager double. `send_to_wait` returns `acked`.
#[derive(Clone)]
pub struct SimManager {
    pub state: Arc<Mutex<SimManagerState>>,
}

impl SimManager {
    pub fn new(this_address: LoraAddress) -> Self {
        let state = SimManagerState {
            this_address: Some(this_address),
            acked: true,
            ..SimManagerState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn push_inbound(&self, from: u8, to: u8, bytes: &[u8]) {
        self.state.lock().unwrap().inbound.push_back(SimDatagram {
            from: LoraAddress(from),
            to: LoraAddress(to),
            bytes: bytes.to_vec(),
        });
    }

    pub fn sent(&self) -> Vec<(LoraAddress, Vec<u8>)> {
        self.state.lock().unwrap().sent.clone()
    }
}

impl ReliableDatagram for SimManager {
    fn init(&mut self) -> Result<(), LinkError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_init {
            return Err(LinkError::Driver("manager".into()));
        }
        s.initialized = true;
        Ok(())
    }

    fn set_frequency(&mut self, mhz: f32) -> Result<(), LinkError> {
        self.state.lock().unwrap().frequency_mhz = mhz;
        Ok(())
    }

    fn set_tx_power(&mut self, dbm: i8) {
        self.state.lock().unwrap().tx_power_dbm = dbm;
    }

    fn set_retries(&mut self, retries: u8) {
        self.state.lock().unwrap().retries = retries;
    }

    fn set_timeout(&mut self, timeout_ms: u64) {
        self.state.lock().unwrap().timeout_ms = timeout_ms;
    }

    fn set_key(&mut self, key: &Key) {
        self.state.lock().unwrap().key = Some(*key);
    }

    fn this_address(&self) -> LoraAddress {
        self.state
            .lock()
            .unwrap()
            .this_address
            .unwrap_or(LoraAddress::BROADCAST)
    }

    fn set_this_address(&mut self, address: LoraAddress) {
        self.state.lock().unwrap().this_address = Some(address);
    }

    fn available(&mut self) -> bool {
        !self.state.lock().unwrap().inbound.is_empty()
    }

    fn recv_from_ack(&mut self, buf: &mut [u8]) -> Option<Datagram> {
        let mut s = self.state.lock().unwrap();
        let datagram = s.inbound.pop_front()?;
        let len = datagram.bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram.bytes[..len]);
        Some(Datagram {
            from: datagram.from,
            to: datagram.to,
            len: s.reported_len.unwrap_or(len),
        })
    }

    fn send_to_wait(&mut self, payload: &[u8], to: LoraAddress) -> bool {
        let mut s = self.state.lock().unwrap();
        s.sent.push((to, payload.to_vec()));
        to.is_broadcast() || s.acked
    }
}
