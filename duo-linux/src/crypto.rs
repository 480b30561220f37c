//! Frame encryption for the emulated radios: ChaCha20-Poly1305 with SHA-256 derived keys.
//! Sealed layout: nonce (12) | ciphertext + tag. The clear header is bound as AAD.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key as CipherKey, Nonce};
use duo_core::{Key, MacAddress};
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Per-link key for the short-range emulation. Both ends derive the same key whichever
/// side computes it; any key or address mismatch yields a different one.
pub fn derive_link_key(primary: &Key, local: &Key, a: &MacAddress, b: &MacAddress) -> [u8; 32] {
    let (lo, hi) = if a.as_bytes() <= b.as_bytes() { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(b"duolink-link-v1");
    hasher.update(primary.as_bytes());
    hasher.update(local.as_bytes());
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    hasher.finalize().into()
}

/// Network-wide key for the long-range emulation.
pub fn derive_radio_key(primary: &Key) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"duolink-radio-v1");
    hasher.update(primary.as_bytes());
    hasher.finalize().into()
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("sealed frame too short")]
    Truncated,
    #[error("decryption failed")]
    Decrypt,
}

pub fn seal(key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(CipherKey::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open(key: &[u8; 32], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Truncated);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(CipherKey::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: MacAddress = MacAddress::new([0x7C, 0xDF, 0xA1, 0x94, 0x8A, 0x06]);
    const B: MacAddress = MacAddress::new([0x7C, 0xDF, 0xA1, 0x94, 0x8D, 0x80]);

    #[test]
    fn link_key_is_order_independent() {
        let pmk = Key::default();
        let lmk = Key::try_from("FEDCBA9876543210").unwrap();
        assert_eq!(
            derive_link_key(&pmk, &lmk, &A, &B),
            derive_link_key(&pmk, &lmk, &B, &A)
        );
        assert_ne!(
            derive_link_key(&pmk, &lmk, &A, &B),
            derive_link_key(&pmk, &Key::default(), &A, &B)
        );
    }

    #[test]
    fn wrong_key_or_header_fails_to_open() {
        let key = derive_radio_key(&Key::default());
        let other = derive_radio_key(&Key::try_from("AAAAAAAAAAAAAAAA").unwrap());
        let sealed = seal(&key, b"hdr", b"hello").unwrap();
        assert_eq!(open(&key, b"hdr", &sealed).unwrap(), b"hello");
        assert!(matches!(open(&other, b"hdr", &sealed), Err(CryptoError::Decrypt)));
        assert!(matches!(open(&key, b"HDR", &sealed), Err(CryptoError::Decrypt)));
        assert!(matches!(open(&key, b"hdr", &sealed[..20]), Err(CryptoError::Truncated)));
    }
}
