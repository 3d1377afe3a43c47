//! Session encryption for the 0x003d envelope frames.
//!
//! The inverter and the server derive a shared session key from a
//! pre-shared 16-byte device key and the 34-byte payload of a 0x0503
//! key-exchange message: the first 16 bytes of the exchange are encrypted
//! with the device key, then XORed with the remaining 16 bytes. Envelope
//! payloads are enciphered with AES-CTR under the derived key, using the
//! first 16 bytes of the payload as the big-endian counter seed.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit};
use chrono::{Local, Utc};
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};
use log::{info, warn};
use rand::{Rng, RngCore};
use thiserror::Error;

/// Length of a key-exchange (0x0503) message payload.
pub const KEY_EXCHANGE_LEN: usize = 34;
/// Random prefix (16) + sequence (2) + pad seed (4) preceding the
/// enciphered payload.
pub const ENVELOPE_OVERHEAD: usize = 22;
/// Cached key-exchange messages older than this are discarded.
pub const KEY_CACHE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CryptoError {
    #[error("key exchange message must be {KEY_EXCHANGE_LEN} bytes, got {0}")]
    InvalidKeyExchangeLength(usize),
    #[error("envelope too short to carry a sequence and pad seed ({0} bytes)")]
    EnvelopeTooShort(usize),
    #[error("device key must be 32 hex characters: {0}")]
    InvalidDeviceKey(String),
}

/// Parse a hex-encoded 16-byte device key.
pub fn parse_device_key(s: &str) -> Result<[u8; 16], CryptoError> {
    let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidDeviceKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| CryptoError::InvalidDeviceKey(format!("{} bytes", b.len())))
}

#[derive(Debug)]
pub struct SessionCipher {
    session_key: [u8; 16],
    pub encrypt_seq: u16,
}

impl SessionCipher {
    pub fn new(device_key: &[u8; 16], key_exchange: &[u8]) -> Result<Self, CryptoError> {
        if key_exchange.len() != KEY_EXCHANGE_LEN {
            return Err(CryptoError::InvalidKeyExchangeLength(key_exchange.len()));
        }
        let device_cipher = Aes128::new(device_key.into());
        let mut block = aes::Block::default();
        block.copy_from_slice(&key_exchange[..16]);
        device_cipher.encrypt_block(&mut block);
        let mut session_key = [0u8; 16];
        for (i, b) in session_key.iter_mut().enumerate() {
            *b = block[i] ^ key_exchange[16 + i];
        }
        Ok(SessionCipher {
            session_key,
            encrypt_seq: rand::thread_rng().r#gen(),
        })
    }

    /// Apply the envelope keystream in place. The first 16 bytes seed the
    /// counter and are not themselves enciphered, so the transform is its
    /// own inverse.
    pub fn crypt(&self, msg: &mut [u8]) {
        if msg.len() <= 16 {
            return;
        }
        let mut counter = [0u8; 16];
        counter.copy_from_slice(&msg[..16]);
        let mut keystream = Ctr128BE::<Aes128>::new(&self.session_key.into(), &counter.into());
        keystream.apply_keystream(&mut msg[16..]);
    }

    /// Encipher `data` into an envelope payload, consuming the next
    /// outbound sequence number.
    pub fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        self.encrypt_seq = self.encrypt_seq.wrapping_add(1);
        let mut msg = vec![0u8; ENVELOPE_OVERHEAD + data.len()];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut msg[..16]);
        msg[16..18].copy_from_slice(&self.encrypt_seq.to_le_bytes());
        rng.fill_bytes(&mut msg[18..22]);
        msg[22..].copy_from_slice(data);
        for i in 0..data.len() {
            msg[22 + i] ^= msg[18 + (i & 3)];
        }
        self.crypt(&mut msg);
        msg
    }

    /// Decipher an envelope payload, returning the peer's sequence number
    /// and the plaintext.
    pub fn decrypt(&self, data: &[u8]) -> Result<(u16, Vec<u8>), CryptoError> {
        if data.len() < ENVELOPE_OVERHEAD {
            return Err(CryptoError::EnvelopeTooShort(data.len()));
        }
        let mut msg = data.to_vec();
        self.crypt(&mut msg);
        let seq = u16::from_le_bytes([msg[16], msg[17]]);
        for i in 0..msg.len() - ENVELOPE_OVERHEAD {
            msg[22 + i] ^= msg[18 + (i & 3)];
        }
        Ok((seq, msg.split_off(ENVELOPE_OVERHEAD)))
    }
}

/// Persists the last key-exchange message so a restart inside the same
/// session can reconstruct the cipher without waiting for the inverter to
/// renegotiate. The cached message is sensitive, so the file is written
/// with owner-only permissions and ignored once it is a day old.
pub struct KeyExchangeStore {
    path: PathBuf,
    restore_attempted: bool,
}

impl KeyExchangeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        KeyExchangeStore {
            path: path.into(),
            restore_attempted: false,
        }
    }

    pub fn save(&self, key_exchange: &[u8]) {
        let now = Local::now();
        let line = format!(
            "{},{},{}\n",
            now.format("%a %b %e %H:%M:%S %Y"),
            now.timestamp(),
            hex::encode(key_exchange)
        );
        if let Err(e) = self.write_restricted(line.as_bytes()) {
            warn!("failed to save key exchange message to {:?}: {e}", self.path);
        }
    }

    #[cfg(unix)]
    fn write_restricted(&self, contents: &[u8]) -> std::io::Result<()> {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)?;
        file.write_all(contents)
    }

    #[cfg(not(unix))]
    fn write_restricted(&self, contents: &[u8]) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(contents)
    }

    /// Return the cached key-exchange message if one was saved within the
    /// last 24 hours. Only one restoration attempt is made per process; a
    /// malformed or stale file is ignored.
    pub fn restore(&mut self) -> Option<Vec<u8>> {
        if self.restore_attempted {
            return None;
        }
        self.restore_attempted = true;
        let contents = std::fs::read_to_string(&self.path).ok()?;
        let mut fields = contents.trim_end().splitn(3, ',');
        let _timestamp = fields.next()?;
        let epoch: i64 = fields.next()?.parse().ok()?;
        let payload = fields.next()?;
        let age = Utc::now().timestamp() - epoch;
        if age < 0 || age as u64 > KEY_CACHE_MAX_AGE.as_secs() {
            info!("ignoring stale key exchange message in {:?}", self.path);
            return None;
        }
        if payload.len() != 2 * KEY_EXCHANGE_LEN {
            info!("ignoring malformed key exchange message in {:?}", self.path);
            return None;
        }
        let msg = hex::decode(payload).ok()?;
        info!("restoring key exchange message from {:?}", self.path);
        Some(msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_cipher() -> SessionCipher {
        SessionCipher::new(&[0u8; 16], &[0u8; KEY_EXCHANGE_LEN]).unwrap()
    }

    #[test]
    fn test_rejects_bad_key_exchange_length() {
        assert_eq!(
            SessionCipher::new(&[0u8; 16], &[0u8; 16]).unwrap_err(),
            CryptoError::InvalidKeyExchangeLength(16)
        );
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let mut cipher = test_cipher();
        let seq_before = cipher.encrypt_seq;
        let envelope = cipher.encrypt(b"test\n");
        assert_eq!(envelope.len(), ENVELOPE_OVERHEAD + 5);
        let (seq, plaintext) = cipher.decrypt(&envelope).unwrap();
        assert_eq!(plaintext, b"test\n");
        assert_eq!(seq, seq_before.wrapping_add(1));
        assert_eq!(cipher.encrypt_seq, seq);
    }

    #[test]
    fn test_round_trip_various_lengths() {
        let mut cipher = test_cipher();
        for len in [4usize, 16, 21, 22, 64, 257] {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let envelope = cipher.encrypt(&data);
            let (_, plaintext) = cipher.decrypt(&envelope).unwrap();
            assert_eq!(plaintext, data, "length {len}");
        }
    }

    #[test]
    fn test_crypt_involution() {
        let cipher = test_cipher();
        let original: Vec<u8> = (0..77u8).collect();
        let mut msg = original.clone();
        cipher.crypt(&mut msg);
        assert_ne!(msg[16..], original[16..]);
        // counter seed bytes pass through untouched
        assert_eq!(msg[..16], original[..16]);
        cipher.crypt(&mut msg);
        assert_eq!(msg, original);
    }

    #[test]
    fn test_decrypt_rejects_short_envelope() {
        let cipher = test_cipher();
        assert_eq!(
            cipher.decrypt(&[0u8; 21]).unwrap_err(),
            CryptoError::EnvelopeTooShort(21)
        );
    }

    #[test]
    fn test_parse_device_key() {
        let key = parse_device_key("000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(key[1], 0x01);
        assert!(parse_device_key("0001").is_err());
        assert!(parse_device_key("not hex at all, not even close!!").is_err());
    }

    #[test]
    fn test_key_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last0503.msg");
        let msg: Vec<u8> = (0..KEY_EXCHANGE_LEN as u8).collect();
        let store = KeyExchangeStore::new(&path);
        store.save(&msg);
        let mut store = KeyExchangeStore::new(&path);
        assert_eq!(store.restore(), Some(msg));
        // only one restoration attempt per process
        assert_eq!(store.restore(), None);
    }

    #[test]
    fn test_key_store_ignores_stale_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last0503.msg");

        let stale = format!(
            "Mon Jan  1 00:00:00 2024,{},{}\n",
            Utc::now().timestamp() - 2 * 24 * 60 * 60,
            hex::encode([0u8; KEY_EXCHANGE_LEN])
        );
        std::fs::write(&path, stale).unwrap();
        assert_eq!(KeyExchangeStore::new(&path).restore(), None);

        std::fs::write(&path, "not,a,validline\n").unwrap();
        assert_eq!(KeyExchangeStore::new(&path).restore(), None);

        assert_eq!(KeyExchangeStore::new(dir.path().join("absent")).restore(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_store_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last0503.msg");
        KeyExchangeStore::new(&path).save(&[0u8; KEY_EXCHANGE_LEN]);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
