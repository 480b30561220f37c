//! Short-range engine: custom framing, identifier/ack/retry state machine and dedup
//! over an encrypted point-to-point datagram link.
//!
//! The link driver completes sends and delivers frames from its own context. The
//! engine hands the driver a [`LinkEvents`] token at startup; that token only ever
//! touches the shared state below (a single-slot inbound mailbox, the send status
//! and the paired address), each as one atomic handoff.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::address::MacAddress;
use crate::clock::Clock;
use crate::integrity::IdentifierMemos;
use crate::mailbox::Mailbox;
use crate::settings::{ChangeFlags, Key, RadioType, Settings};
use crate::transport::{
    InitError, LinkError, Messenger, PayloadCallback, PingCallback, SendError, SettingsError,
    SettingsFailure, SettingsStep,
};
use crate::wire::{self, PacketHeader, PacketType, MAX_FRAME_LEN, MAX_PAYLOAD_LEN};

/// Retries after the first attempt; 4 sends in total.
pub const MAX_SEND_RETRIES: u32 = 3;

/// How long to wait for the paired device's ack after each send.
pub const ACK_TIMEOUT_MS: u64 = 500;

/// Upper bound on waiting for the driver's send-done event.
pub const SEND_DONE_TIMEOUT_MS: u64 = 1000;

/// Radio channel both devices are fixed to.
pub const PEER_CHANNEL: u8 = 1;

const IDENTIFIER_SEED_MIN: u16 = 10_000;
const IDENTIFIER_SEED_MAX: u16 = 20_000;

/// Peer table entry installed on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: MacAddress,
    pub channel: u8,
    pub encrypt: bool,
    pub local_key: Key,
}

/// Driver seam for the short-range datagram link.
///
/// `send` only reports whether the frame was queued; the outcome arrives later
/// through [`LinkEvents::on_data_sent`], possibly from another thread.
pub trait PeerLink {
    fn init(&mut self) -> Result<(), LinkError>;
    fn set_primary_key(&mut self, key: &Key) -> Result<(), LinkError>;
    fn peers(&self) -> Result<Vec<MacAddress>, LinkError>;
    fn add_peer(&mut self, peer: &PeerInfo) -> Result<(), LinkError>;
    fn delete_peer(&mut self, address: &MacAddress) -> Result<(), LinkError>;
    fn peer_exists(&self, address: &MacAddress) -> bool;
    fn send(&mut self, to: &MacAddress, frame: &[u8]) -> Result<(), LinkError>;
    /// Hand the driver the context it must call back into.
    fn register(&mut self, events: LinkEvents);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum SendStatus {
    Idle = 0,
    Sending = 1,
    WaitingForAck = 2,
    Success = 3,
    Failure = 4,
}

impl SendStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SendStatus::Sending,
            2 => SendStatus::WaitingForAck,
            3 => SendStatus::Success,
            4 => SendStatus::Failure,
            _ => SendStatus::Idle,
        }
    }
}

#[derive(Debug)]
struct InboundFrame {
    from: MacAddress,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct LinkShared {
    inbound: Mailbox<InboundFrame>,
    send_status: AtomicU8,
    sending_type: AtomicU8,
    paired: AtomicU64,
}

impl LinkShared {
    fn status(&self) -> SendStatus {
        SendStatus::from_u8(self.send_status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: SendStatus) {
        self.send_status.store(status as u8, Ordering::Release);
    }

    fn paired(&self) -> MacAddress {
        MacAddress::from_u64(self.paired.load(Ordering::Acquire))
    }
}

/// Context token the driver calls back into. Cheap to clone; safe to use from any thread.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    shared: Arc<LinkShared>,
}

impl LinkEvents {
    /// Send-done event. `delivered` is the link-level result (peer heard the frame).
    pub fn on_data_sent(&self, to: &MacAddress, delivered: bool) {
        let kind = PacketType::try_from(self.shared.sending_type.load(Ordering::Acquire)).ok();
        let next = match (kind, delivered) {
            (Some(PacketType::Message), true) => SendStatus::WaitingForAck,
            (Some(_), true) => SendStatus::Success,
            _ => SendStatus::Failure,
        };
        debug!(%to, delivered, ?kind, "send done");
        // Only the send currently in flight may be completed; late events are ignored.
        let _ = self.shared.send_status.compare_exchange(
            SendStatus::Sending as u8,
            next as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Receive event. Drops frames from other devices, oversized frames, and
    /// anything arriving while the previous frame is still unprocessed.
    pub fn on_data_received(&self, from: &MacAddress, data: &[u8]) {
        if *from != self.shared.paired() {
            debug!(%from, "frame from unknown device, ignoring");
            return;
        }
        if data.len() > MAX_FRAME_LEN {
            warn!(len = data.len(), "oversized frame, ignoring");
            return;
        }
        let frame = InboundFrame {
            from: *from,
            bytes: data.to_vec(),
        };
        if self.shared.inbound.offer(frame).is_err() {
            warn!("messenger not ready, discarding received frame");
            return;
        }
        debug!(len = data.len(), "frame received");
    }
}

/// The short-range messenger.
pub struct EspNowMessenger<L: PeerLink, C: Clock> {
    link: L,
    clock: C,
    shared: Arc<LinkShared>,
    other_address: MacAddress,
    next_identifier: u16,
    memos: IdentifierMemos,
    payload_callback: Option<PayloadCallback>,
    ping_callback: Option<PingCallback>,
}

impl<L: PeerLink, C: Clock> EspNowMessenger<L, C> {
    /// Bring up the link: init, primary key, peer table, event registration.
    pub fn begin(
        link: L,
        clock: C,
        other_address: MacAddress,
        primary_key: &Key,
        local_key: &Key,
    ) -> Result<Self, InitError> {
        let shared = Arc::new(LinkShared {
            inbound: Mailbox::new(),
            send_status: AtomicU8::new(SendStatus::Idle as u8),
            sending_type: AtomicU8::new(PacketType::Message as u8),
            paired: AtomicU64::new(other_address.to_u64()),
        });
        // Randomized so a rebooted device is unlikely to reuse identifiers the
        // peer still remembers.
        let next_identifier = rand::thread_rng().gen_range(IDENTIFIER_SEED_MIN..IDENTIFIER_SEED_MAX);
        let mut messenger = Self {
            link,
            clock,
            shared,
            other_address,
            next_identifier,
            memos: IdentifierMemos::new(),
            payload_callback: None,
            ping_callback: None,
        };

        messenger.link.init().map_err(|e| {
            warn!(error = %e, "failed to initialize short-range link");
            InitError::Radio(e)
        })?;
        messenger
            .link
            .set_primary_key(primary_key)
            .map_err(InitError::PrimaryKey)?;
        messenger
            .set_peer(other_address, local_key)
            .map_err(InitError::Peer)?;
        let events = messenger.events();
        messenger.link.register(events);

        info!(peer = %other_address, "short-range messenger ready");
        Ok(messenger)
    }

    fn events(&self) -> LinkEvents {
        LinkEvents {
            shared: self.shared.clone(),
        }
    }

    pub fn other_address(&self) -> MacAddress {
        self.other_address
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Next message identifier. Never 0.
    fn allocate_identifier(&mut self) -> u16 {
        self.next_identifier = self.next_identifier.wrapping_add(1);
        if self.next_identifier == 0 {
            self.next_identifier = 1;
        }
        self.next_identifier
    }

    /// Hand one frame to the link and wait for its send-done event.
    fn send_and_wait_done(
        &mut self,
        to: MacAddress,
        frame: &[u8],
        kind: PacketType,
    ) -> Result<SendStatus, LinkError> {
        self.shared.sending_type.store(kind as u8, Ordering::Release);
        self.shared.set_status(SendStatus::Sending);
        if let Err(e) = self.link.send(&to, frame) {
            self.shared.set_status(SendStatus::Idle);
            return Err(e);
        }
        let start = self.clock.now_ms();
        while self.shared.status() == SendStatus::Sending {
            if self.clock.now_ms().saturating_sub(start) >= SEND_DONE_TIMEOUT_MS {
                warn!(?kind, "no send-done event from link");
                let _ = self.shared.send_status.compare_exchange(
                    SendStatus::Sending as u8,
                    SendStatus::Failure as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                break;
            }
            self.clock.yield_now();
        }
        Ok(self.shared.status())
    }

    /// Poll the inbound slot for the ack carrying `identifier`.
    /// Anything else that shows up meanwhile is discarded; the peer retries its own sends.
    fn wait_for_ack(&mut self, identifier: u16) -> bool {
        let start = self.clock.now_ms();
        while self.clock.now_ms().saturating_sub(start) < ACK_TIMEOUT_MS {
            if let Some(frame) = self.shared.inbound.take() {
                match PacketHeader::from_bytes(&frame.bytes) {
                    Ok(h) if h.packet_type == PacketType::Ack && h.identifier == identifier => {
                        debug!(identifier, "ack received");
                        return true;
                    }
                    Ok(h) => {
                        debug!(kind = ?h.packet_type, id = h.identifier, "discarding frame while waiting for ack")
                    }
                    Err(e) => debug!(error = %e, "discarding bad frame while waiting for ack"),
                }
            }
            self.clock.yield_now();
        }
        false
    }

    fn handle_frame(&mut self, frame: InboundFrame) {
        let (header, payload) = match wire::decode_frame(&frame.bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return;
            }
        };

        match header.packet_type {
            PacketType::Ping => {
                debug!("ping received");
                if let Some(cb) = self.ping_callback.as_mut() {
                    cb();
                }
            }
            PacketType::Ack => {
                warn!(id = header.identifier, "unexpected ack outside a send, dropping");
            }
            PacketType::Message => {
                debug!(id = header.identifier, "message received, sending ack");
                self.send_ack(frame.from, header.identifier);

                let now = self.clock.now_ms();
                if self.memos.is_recognized(header.identifier, now) {
                    debug!(id = header.identifier, "already delivered, ignoring");
                    return;
                }
                if let Some(cb) = self.payload_callback.as_mut() {
                    cb(payload);
                }
                self.memos.record(header.identifier, now);
            }
        }
    }

    /// One-shot ack; a lost ack is recovered by the sender's retry.
    fn send_ack(&mut self, to: MacAddress, identifier: u16) {
        let ack = wire::encode_control(PacketType::Ack, identifier);
        match self.send_and_wait_done(to, &ack, PacketType::Ack) {
            Ok(SendStatus::Success) => debug!(identifier, "ack sent"),
            Ok(status) => warn!(identifier, ?status, "ack send failed"),
            Err(e) => warn!(identifier, error = %e, "link refused ack"),
        }
        self.shared.set_status(SendStatus::Idle);
    }

    /// Replace the peer table with a single entry for `address`.
    fn set_peer(&mut self, address: MacAddress, local_key: &Key) -> Result<(), LinkError> {
        self.delete_all_peers();

        self.other_address = address;
        self.shared.paired.store(address.to_u64(), Ordering::Release);
        info!(peer = %address, "new peer address");

        let peer = PeerInfo {
            address,
            channel: PEER_CHANNEL,
            encrypt: true,
            local_key: *local_key,
        };
        self.link.add_peer(&peer).map_err(|e| {
            warn!(error = %e, "failed to add peer");
            e
        })?;
        if !self.link.peer_exists(&address) {
            warn!(peer = %address, "add peer failed, not found after adding");
            return Err(LinkError::PeerNotFound(address));
        }
        Ok(())
    }

    /// Best effort: failures are logged and the remaining peers still deleted.
    fn delete_all_peers(&mut self) {
        let peers = match self.link.peers() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to fetch peer list");
                return;
            }
        };
        if peers.is_empty() {
            debug!("no peers to delete");
            return;
        }
        debug!(count = peers.len(), "deleting peers");
        for peer in peers {
            if let Err(e) = self.link.delete_peer(&peer) {
                warn!(%peer, error = %e, "failed to delete peer");
            }
        }
    }
}

impl<L: PeerLink, C: Clock> Messenger for EspNowMessenger<L, C> {
    fn kind(&self) -> RadioType {
        RadioType::EspNow
    }

    fn update_rx(&mut self) {
        if let Some(frame) = self.shared.inbound.take() {
            self.handle_frame(frame);
        }
    }

    fn tx_wait(&mut self, payload: &[u8]) -> Result<(), SendError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(SendError::TooLong { len: payload.len() });
        }
        let identifier = self.allocate_identifier();
        let frame = wire::encode_frame(identifier, payload)
            .map_err(|_| SendError::TooLong { len: payload.len() })?;
        let attempts = MAX_SEND_RETRIES + 1;

        for attempt in 1..=attempts {
            debug!(attempt, identifier, "send attempt");
            let status = match self.send_and_wait_done(self.other_address, &frame, PacketType::Message) {
                Ok(status) => status,
                Err(e) => {
                    warn!(error = %e, "link refused send");
                    return Err(SendError::Link(e));
                }
            };
            match status {
                SendStatus::WaitingForAck => {}
                SendStatus::Failure => {
                    warn!(identifier, "send failed: paired device not detected");
                    self.shared.set_status(SendStatus::Idle);
                    return Err(SendError::PeerUnreachable);
                }
                other => {
                    warn!(identifier, status = ?other, "unexpected status after sending");
                    self.shared.set_status(SendStatus::Idle);
                    return Err(SendError::UnexpectedStatus);
                }
            }

            if self.wait_for_ack(identifier) {
                self.shared.set_status(SendStatus::Idle);
                return Ok(());
            }
            debug!(attempt, identifier, "wait for ack timed out");
        }

        warn!(identifier, attempts, "no ack, giving up");
        self.shared.set_status(SendStatus::Idle);
        Err(SendError::NoAck { attempts })
    }

    fn ping(&mut self) {
        debug!("sending ping");
        let frame = wire::encode_control(PacketType::Ping, 0);
        match self.send_and_wait_done(self.other_address, &frame, PacketType::Ping) {
            Ok(SendStatus::Success) => debug!("ping sent"),
            Ok(status) => debug!(?status, "ping failed"),
            Err(e) => warn!(error = %e, "failed to send ping"),
        }
        self.shared.set_status(SendStatus::Idle);
    }

    fn settings_changed(
        &mut self,
        settings: &Settings,
        changes: ChangeFlags,
    ) -> Result<(), SettingsError> {
        let mut failures = Vec::new();
        let mut update_peer = false;

        if changes.contains(ChangeFlags::PRIMARY_KEY) {
            info!("setting primary key");
            if let Err(error) = self.link.set_primary_key(settings.primary_key()) {
                warn!(%error, "failed to set primary key");
                failures.push(SettingsFailure {
                    step: SettingsStep::PrimaryKey,
                    error,
                });
            }
            // The local key is derived from the primary key by the link.
            debug!("peer needs update (primary key changed)");
            update_peer = true;
        }
        if changes.contains(ChangeFlags::LOCAL_KEY) {
            debug!("peer needs update (local key changed)");
            update_peer = true;
        }
        if changes.contains(ChangeFlags::OTHER_ADDRESS) {
            debug!("peer needs update (other address changed)");
            update_peer = true;
        }

        if update_peer {
            info!("rebuilding peer table");
            if let Err(error) = self.set_peer(settings.other_mac_address(), settings.local_key()) {
                failures.push(SettingsFailure {
                    step: SettingsStep::PeerTable,
                    error,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SettingsError { failures })
        }
    }

    fn set_payload_callback(&mut self, callback: PayloadCallback) {
        self.payload_callback = Some(callback);
    }

    fn set_ping_callback(&mut self, callback: PingCallback) {
        self.ping_callback = Some(callback);
    }
}
