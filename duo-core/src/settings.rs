//! Settings boundary: key material, addresses, radio selection and change flags.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::address::{LoraAddress, MacAddress};

pub const KEY_LEN: usize = 16;

const DEFAULT_KEY: &[u8; KEY_LEN] = b"0123456789ABCDEF";

/// 16-byte key. Serialized as a 16-character string, the way it is typed in on the device.
#[derive(Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub const fn new(bytes: [u8; KEY_LEN]) -> Self {
        Key(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Default for Key {
    fn default() -> Self {
        Key(*DEFAULT_KEY)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(..)")
    }
}

impl TryFrom<&str> for Key {
    type Error = KeyError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let bytes: [u8; KEY_LEN] = s
            .as_bytes()
            .try_into()
            .map_err(|_| KeyError::Length(s.len()))?;
        Ok(Key(bytes))
    }
}

impl TryFrom<String> for Key {
    type Error = KeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Key::try_from(s.as_str())
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        String::from_utf8_lossy(&key.0).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key must be exactly {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

/// Which radio carries messages. Chosen once at boot; switching needs a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RadioType {
    #[default]
    EspNow,
    Lora,
}

/// Everything the transports read from the persisted settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub radio: RadioType,
    /// Shared by both radios.
    #[serde(default)]
    pub primary_key: Key,
    /// Short-range only; bound to the paired address by the link.
    #[serde(default)]
    pub local_key: Key,
    #[serde(default)]
    pub other_mac: MacAddress,
    #[serde(default = "default_lora_address")]
    pub my_lora_address: LoraAddress,
    #[serde(default = "default_lora_address")]
    pub other_lora_address: LoraAddress,
}

fn default_lora_address() -> LoraAddress {
    LoraAddress::BROADCAST
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            radio: RadioType::default(),
            primary_key: Key::default(),
            local_key: Key::default(),
            other_mac: MacAddress::default(),
            my_lora_address: default_lora_address(),
            other_lora_address: default_lora_address(),
        }
    }
}

impl Settings {
    pub fn primary_key(&self) -> &Key {
        &self.primary_key
    }

    pub fn local_key(&self) -> &Key {
        &self.local_key
    }

    pub fn other_mac_address(&self) -> MacAddress {
        self.other_mac
    }

    pub fn my_lora_address(&self) -> LoraAddress {
        self.my_lora_address
    }

    pub fn other_lora_address(&self) -> LoraAddress {
        self.other_lora_address
    }
}

/// Which settings fields were edited. Passed to `settings_changed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChangeFlags(u8);

impl ChangeFlags {
    pub const PRIMARY_KEY: ChangeFlags = ChangeFlags(1 << 0);
    pub const LOCAL_KEY: ChangeFlags = ChangeFlags(1 << 1);
    pub const MY_ADDRESS: ChangeFlags = ChangeFlags(1 << 2);
    pub const OTHER_ADDRESS: ChangeFlags = ChangeFlags(1 << 3);

    const ALL: u8 = 0b1111;

    pub const fn empty() -> Self {
        ChangeFlags(0)
    }

    pub const fn all() -> Self {
        ChangeFlags(Self::ALL)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Unknown high bits are dropped.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        ChangeFlags(bits & Self::ALL)
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn contains(&self, other: ChangeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ChangeFlags) {
        self.0 |= other.0;
    }

    /// Diff two settings snapshots. Only the fields relevant to `new.radio` are compared,
    /// except the primary key which both radios use.
    pub fn between(old: &Settings, new: &Settings) -> Self {
        let mut flags = ChangeFlags::empty();
        if old.primary_key != new.primary_key {
            flags.insert(ChangeFlags::PRIMARY_KEY);
        }
        match new.radio {
            RadioType::EspNow => {
                if old.local_key != new.local_key {
                    flags.insert(ChangeFlags::LOCAL_KEY);
                }
                if old.other_mac != new.other_mac {
                    flags.insert(ChangeFlags::OTHER_ADDRESS);
                }
            }
            RadioType::Lora => {
                if old.my_lora_address != new.my_lora_address {
                    flags.insert(ChangeFlags::MY_ADDRESS);
                }
                if old.other_lora_address != new.other_lora_address {
                    flags.insert(ChangeFlags::OTHER_ADDRESS);
                }
            }
        }
        flags
    }
}

impl BitOr for ChangeFlags {
    type Output = ChangeFlags;

    fn bitor(self, rhs: ChangeFlags) -> ChangeFlags {
        ChangeFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChangeFlags {
    fn bitor_assign(&mut self, rhs: ChangeFlags) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_requires_sixteen_bytes() {
        assert!(Key::try_from("0123456789ABCDEF").is_ok());
        assert_eq!(Key::try_from("short"), Err(KeyError::Length(5)));
        assert_eq!(format!("{:?}", Key::default()), "Key(..)");
    }

    #[test]
    fn flags_ops() {
        let mut flags = ChangeFlags::PRIMARY_KEY | ChangeFlags::OTHER_ADDRESS;
        assert!(flags.contains(ChangeFlags::PRIMARY_KEY));
        assert!(!flags.contains(ChangeFlags::LOCAL_KEY));
        flags.insert(ChangeFlags::LOCAL_KEY);
        assert_eq!(flags.bits(), 0b1011);
        assert_eq!(ChangeFlags::from_bits_truncate(0xFF), ChangeFlags::all());
        assert!(ChangeFlags::empty().is_empty());
    }

    #[test]
    fn diff_espnow_fields() {
        let old = Settings::default();
        let mut new = old.clone();
        new.other_mac = MacAddress::new([1, 2, 3, 4, 5, 6]);
        new.my_lora_address = LoraAddress(0x2A);
        assert_eq!(ChangeFlags::between(&old, &new), ChangeFlags::OTHER_ADDRESS);

        new.local_key = Key::try_from("FEDCBA9876543210").unwrap();
        assert_eq!(
            ChangeFlags::between(&old, &new),
            ChangeFlags::OTHER_ADDRESS | ChangeFlags::LOCAL_KEY
        );
    }

    #[test]
    fn diff_lora_fields() {
        let old = Settings {
            radio: RadioType::Lora,
            ..Settings::default()
        };
        let mut new = old.clone();
        new.my_lora_address = LoraAddress(0x2A);
        new.local_key = Key::try_from("FEDCBA9876543210").unwrap();
        new.primary_key = Key::try_from("AAAAAAAAAAAAAAAA").unwrap();
        assert_eq!(
            ChangeFlags::between(&old, &new),
            ChangeFlags::PRIMARY_KEY | ChangeFlags::MY_ADDRESS
        );
    }

    #[test]
    fn settings_from_toml() {
        let s: Settings = toml::from_str(
            r#"
            radio = "lora"
            primary_key = "AAAAAAAAAAAAAAAA"
            other_mac = "7C:DF:A1:94:8D:80"
            my_lora_address = 42
            other_lora_address = 19
            "#,
        )
        .unwrap();
        assert_eq!(s.radio, RadioType::Lora);
        assert_eq!(s.primary_key().as_bytes(), b"AAAAAAAAAAAAAAAA");
        assert_eq!(s.local_key(), &Key::default());
        assert_eq!(s.my_lora_address(), LoraAddress(0x2A));
        assert_eq!(s.other_lora_address(), LoraAddress(0x13));
        assert_eq!(s.other_mac_address().to_string(), "7C:DF:A1:94:8D:80");
    }
}
