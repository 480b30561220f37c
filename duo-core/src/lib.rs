//! Transport layer for a pair of handheld messengers.
//! Two interchangeable engines behind one [`Messenger`] interface; radios are
//! reached through driver traits so the host decides what the "radio" is.

pub mod address;
pub mod clock;
pub mod espnow;
pub mod heartbeat;
pub mod integrity;
pub mod lora;
pub mod mailbox;
pub mod message;
pub mod settings;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testing;

pub use address::{LoraAddress, MacAddress};
pub use clock::{Clock, SystemClock};
pub use espnow::{EspNowMessenger, LinkEvents, PeerInfo, PeerLink};
pub use heartbeat::Heartbeat;
pub use lora::{Datagram, LoRaMessenger, RadioConfig, ReliableDatagram};
pub use message::{Message, MessageHistory, Sender};
pub use settings::{ChangeFlags, Key, RadioType, Settings};
pub use transport::{InitError, LinkError, Messenger, SendError, SettingsError, Transport};
