//! Link addresses: 6-byte MAC for the short-range link, 1-byte station address for the long-range radio.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Short-range link address. Serialized as `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const LEN: usize = 6;
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Pack into the low 48 bits of a word, so the address fits in one atomic store.
    pub fn to_u64(&self) -> u64 {
        let mut word = [0u8; 8];
        word[..6].copy_from_slice(&self.0);
        u64::from_le_bytes(word)
    }

    pub fn from_u64(word: u64) -> Self {
        let bytes = word.to_le_bytes();
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&bytes[..6]);
        MacAddress(addr)
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| AddressParseError::Mac(s.to_string()))?;
            if part.len() != 2 {
                return Err(AddressParseError::Mac(s.to_string()));
            }
            *byte =
                u8::from_str_radix(part, 16).map_err(|_| AddressParseError::Mac(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddressParseError::Mac(s.to_string()));
        }
        Ok(MacAddress(out))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = AddressParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(addr: MacAddress) -> Self {
        addr.to_string()
    }
}

/// Long-range station address.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoraAddress(pub u8);

impl LoraAddress {
    /// Reaches every station; only used for pings.
    pub const BROADCAST: LoraAddress = LoraAddress(0xFF);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for LoraAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

impl FromStr for LoraAddress {
    type Err = AddressParseError;

    /// Accepts `0x2A` or decimal `42`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u8::from_str_radix(hex, 16),
            None => s.parse::<u8>(),
        };
        parsed
            .map(LoraAddress)
            .map_err(|_| AddressParseError::Lora(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("invalid MAC address: {0}")]
    Mac(String),
    #[error("invalid station address: {0}")]
    Lora(String),
}
