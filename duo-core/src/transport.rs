//! The transport interface shared by both radio engines, and its error types.

use crate::address::MacAddress;
use crate::clock::Clock;
use crate::espnow::{EspNowMessenger, PeerLink};
use crate::lora::{LoRaMessenger, ReliableDatagram};
use crate::settings::{ChangeFlags, RadioType, Settings};

/// Invoked with each newly delivered payload.
pub type PayloadCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Invoked when the paired device pings.
pub type PingCallback = Box<dyn FnMut() + Send>;

/// What the application loop drives. Both engines implement it identically.
///
/// Register both callbacks before the first `update_rx`; `update_rx` must be
/// called every loop iteration or inbound frames back up and get dropped.
pub trait Messenger {
    fn kind(&self) -> RadioType;

    /// Non-blocking poll. May invoke the payload or ping callback before returning.
    fn update_rx(&mut self);

    /// Blocking send to the paired device. `Ok` only after positive acknowledgment.
    fn tx_wait(&mut self, payload: &[u8]) -> Result<(), SendError>;

    /// Fire-and-forget heartbeat.
    fn ping(&mut self);

    /// Apply the relevant subset of `changes`. Every step is attempted even after one
    /// fails; nothing is rolled back.
    fn settings_changed(
        &mut self,
        settings: &Settings,
        changes: ChangeFlags,
    ) -> Result<(), SettingsError>;

    fn set_payload_callback(&mut self, callback: PayloadCallback);

    fn set_ping_callback(&mut self, callback: PingCallback);
}

impl<T: Messenger + ?Sized> Messenger for Box<T> {
    fn kind(&self) -> RadioType {
        (**self).kind()
    }

    fn update_rx(&mut self) {
        (**self).update_rx()
    }

    fn tx_wait(&mut self, payload: &[u8]) -> Result<(), SendError> {
        (**self).tx_wait(payload)
    }

    fn ping(&mut self) {
        (**self).ping()
    }

    fn settings_changed(
        &mut self,
        settings: &Settings,
        changes: ChangeFlags,
    ) -> Result<(), SettingsError> {
        (**self).settings_changed(settings, changes)
    }

    fn set_payload_callback(&mut self, callback: PayloadCallback) {
        (**self).set_payload_callback(callback)
    }

    fn set_ping_callback(&mut self, callback: PingCallback) {
        (**self).set_ping_callback(callback)
    }
}

/// The engine picked at boot from the configured radio. Never switched at runtime.
pub enum Transport<L: PeerLink, C: Clock, M: ReliableDatagram> {
    EspNow(EspNowMessenger<L, C>),
    Lora(LoRaMessenger<M>),
}

impl<L: PeerLink, C: Clock, M: ReliableDatagram> Messenger for Transport<L, C, M> {
    fn kind(&self) -> RadioType {
        match self {
            Transport::EspNow(m) => m.kind(),
            Transport::Lora(m) => m.kind(),
        }
    }

    fn update_rx(&mut self) {
        match self {
            Transport::EspNow(m) => m.update_rx(),
            Transport::Lora(m) => m.update_rx(),
        }
    }

    fn tx_wait(&mut self, payload: &[u8]) -> Result<(), SendError> {
        match self {
            Transport::EspNow(m) => m.tx_wait(payload),
            Transport::Lora(m) => m.tx_wait(payload),
        }
    }

    fn ping(&mut self) {
        match self {
            Transport::EspNow(m) => m.ping(),
            Transport::Lora(m) => m.ping(),
        }
    }

    fn settings_changed(
        &mut self,
        settings: &Settings,
        changes: ChangeFlags,
    ) -> Result<(), SettingsError> {
        match self {
            Transport::EspNow(m) => m.settings_changed(settings, changes),
            Transport::Lora(m) => m.settings_changed(settings, changes),
        }
    }

    fn set_payload_callback(&mut self, callback: PayloadCallback) {
        match self {
            Transport::EspNow(m) => m.set_payload_callback(callback),
            Transport::Lora(m) => m.set_payload_callback(callback),
        }
    }

    fn set_ping_callback(&mut self, callback: PingCallback) {
        match self {
            Transport::EspNow(m) => m.set_ping_callback(callback),
            Transport::Lora(m) => m.set_ping_callback(callback),
        }
    }
}

/// Error reported by a radio driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("radio not initialized")]
    NotInitialized,
    #[error("peer {0} not found")]
    PeerNotFound(MacAddress),
    #[error("peer table full")]
    PeerTableFull,
    #[error("frame of {0} bytes too large for the link")]
    TooLarge(usize),
    #[error("driver error: {0}")]
    Driver(String),
}

/// Why `tx_wait` did not get an acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Rejected before any radio I/O.
    #[error("payload of {len} bytes exceeds the message limit")]
    TooLong { len: usize },
    /// The link could not reach the paired device. Not retried.
    #[error("paired device not detected")]
    PeerUnreachable,
    /// Every attempt went out but none was acknowledged.
    #[error("no acknowledgment after {attempts} attempts")]
    NoAck { attempts: u32 },
    #[error("link refused send: {0}")]
    Link(#[from] LinkError),
    #[error("unexpected send status")]
    UnexpectedStatus,
}

/// A settings step that could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsStep {
    PrimaryKey,
    PeerTable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFailure {
    pub step: SettingsStep,
    pub error: LinkError,
}

/// One or more settings steps failed. The others were still applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} settings step(s) failed", .failures.len())]
pub struct SettingsError {
    pub failures: Vec<SettingsFailure>,
}

impl SettingsError {
    pub fn failed(&self, step: SettingsStep) -> bool {
        self.failures.iter().any(|f| f.step == step)
    }
}

/// Radio bring-up failed. Fatal to startup; the caller decides what to do.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    #[error("radio init failed: {0}")]
    Radio(LinkError),
    #[error("setting primary key failed: {0}")]
    PrimaryKey(LinkError),
    #[error("installing paired peer failed: {0}")]
    Peer(LinkError),
    #[error("setting frequency failed: {0}")]
    Frequency(LinkError),
}
