//! Long-range engine: a thin adapter over a reliable-datagram manager, which owns
//! addressing, acknowledgment, retries and encryption.

use tracing::{debug, info, warn};

use crate::address::LoraAddress;
use crate::settings::{ChangeFlags, Key, RadioType, Settings};
use crate::transport::{
    InitError, LinkError, Messenger, PayloadCallback, PingCallback, SendError, SettingsError,
};
use crate::wire::MAX_PAYLOAD_LEN;

/// Broadcast payload that means "ping". Never acknowledged.
pub const PING_SENTINEL: [u8; 2] = [0x31, 0x41];

/// Metadata for one received datagram; the bytes land in the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram {
    pub from: LoraAddress,
    pub to: LoraAddress,
    pub len: usize,
}

/// Driver seam for an addressed, acknowledging datagram manager.
pub trait ReliableDatagram {
    fn init(&mut self) -> Result<(), LinkError>;
    fn set_frequency(&mut self, mhz: f32) -> Result<(), LinkError>;
    fn set_tx_power(&mut self, dbm: i8);
    fn set_retries(&mut self, retries: u8);
    fn set_timeout(&mut self, timeout_ms: u64);
    fn set_key(&mut self, key: &Key);
    fn this_address(&self) -> LoraAddress;
    fn set_this_address(&mut self, address: LoraAddress);
    fn available(&mut self) -> bool;
    /// Receive one datagram into `buf`, acknowledging it if it was unicast.
    fn recv_from_ack(&mut self, buf: &mut [u8]) -> Option<Datagram>;
    /// Send and wait for the manager's ack, retrying internally. Broadcasts are
    /// not acknowledged.
    fn send_to_wait(&mut self, payload: &[u8], to: LoraAddress) -> bool;
}

/// Radio parameters applied by [`LoRaMessenger::begin`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadioConfig {
    pub frequency_mhz: f32,
    pub tx_power_dbm: i8,
    pub retries: u8,
    pub timeout_ms: u64,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_mhz: 915.0,
            tx_power_dbm: 23,
            retries: 6,
            timeout_ms: 500,
        }
    }
}

pub struct LoRaMessenger<M: ReliableDatagram> {
    manager: M,
    other_address: LoraAddress,
    rx_buffer: [u8; MAX_PAYLOAD_LEN],
    payload_callback: Option<PayloadCallback>,
    ping_callback: Option<PingCallback>,
}

impl<M: ReliableDatagram> LoRaMessenger<M> {
    pub fn new(mut manager: M, my_address: LoraAddress, other_address: LoraAddress) -> Self {
        manager.set_this_address(my_address);
        Self {
            manager,
            other_address,
            rx_buffer: [0; MAX_PAYLOAD_LEN],
            payload_callback: None,
            ping_callback: None,
        }
    }

    pub fn begin(&mut self, primary_key: &Key, config: &RadioConfig) -> Result<(), InitError> {
        self.manager.init().map_err(|e| {
            warn!(error = %e, "failed to initialize long-range radio");
            InitError::Radio(e)
        })?;
        self.manager
            .set_frequency(config.frequency_mhz)
            .map_err(|e| {
                warn!(error = %e, mhz = config.frequency_mhz, "failed to set frequency");
                InitError::Frequency(e)
            })?;
        self.manager.set_tx_power(config.tx_power_dbm);
        self.manager.set_key(primary_key);
        self.manager.set_retries(config.retries);
        self.manager.set_timeout(config.timeout_ms);
        info!(
            me = %self.manager.this_address(),
            peer = %self.other_address,
            mhz = config.frequency_mhz,
            "long-range messenger ready"
        );
        Ok(())
    }

    pub fn other_address(&self) -> LoraAddress {
        self.other_address
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }
}

impl<M: ReliableDatagram> Messenger for LoRaMessenger<M> {
    fn kind(&self) -> RadioType {
        RadioType::Lora
    }

    fn update_rx(&mut self) {
        if !self.manager.available() {
            return;
        }
        let Some(datagram) = self.manager.recv_from_ack(&mut self.rx_buffer) else {
            return;
        };
        if datagram.from != self.other_address {
            debug!(from = %datagram.from, "datagram from unknown device, ignoring");
            return;
        }
        let len = datagram.len.min(self.rx_buffer.len());
        let payload = &self.rx_buffer[..len];

        if datagram.to.is_broadcast() {
            // Broadcast is reserved for pings.
            if payload.starts_with(&PING_SENTINEL) {
                debug!("ping received");
                if let Some(cb) = self.ping_callback.as_mut() {
                    cb();
                }
            }
        } else if datagram.to == self.manager.this_address() {
            debug!(len, "message received");
            if let Some(cb) = self.payload_callback.as_mut() {
                cb(payload);
            }
        } else {
            debug!(to = %datagram.to, "datagram for another address, ignoring");
        }
    }

    fn tx_wait(&mut self, payload: &[u8]) -> Result<(), SendError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(SendError::TooLong { len: payload.len() });
        }
        if self.manager.send_to_wait(payload, self.other_address) {
            Ok(())
        } else {
            warn!(peer = %self.other_address, "no acknowledgment from paired device");
            Err(SendError::PeerUnreachable)
        }
    }

    fn ping(&mut self) {
        debug!("sending ping");
        let _ = self.manager.send_to_wait(&PING_SENTINEL, LoraAddress::BROADCAST);
    }

    /// Every change applies locally; this never fails.
    fn settings_changed(
        &mut self,
        settings: &Settings,
        changes: ChangeFlags,
    ) -> Result<(), SettingsError> {
        if changes.contains(ChangeFlags::MY_ADDRESS) {
            info!(address = %settings.my_lora_address(), "setting long-range address");
            self.manager.set_this_address(settings.my_lora_address());
        }
        if changes.contains(ChangeFlags::OTHER_ADDRESS) {
            info!(address = %settings.other_lora_address(), "setting other long-range address");
            self.other_address = settings.other_lora_address();
        }
        if changes.contains(ChangeFlags::PRIMARY_KEY) {
            info!("setting long-range primary key");
            self.manager.set_key(settings.primary_key());
        }
        Ok(())
    }

    fn set_payload_callback(&mut self, callback: PayloadCallback) {
        self.payload_callback = Some(callback);
    }

    fn set_ping_callback(&mut self, callback: PingCallback) {
        self.ping_callback = Some(callback);
    }
}
