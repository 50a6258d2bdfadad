//! RPMB authentication codes (HMAC-SHA256).
//!
//! A single MAC context can be fed several frames in sequence, which is how
//! multi-block reads are authenticated as one unit.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{MmcError, Result};

pub type HmacSha256 = Hmac<Sha256>;

pub const RPMB_KEY_SIZE: usize = 32;
pub const RPMB_MAC_SIZE: usize = 32;

/// 32-byte RPMB authentication key. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RpmbKey([u8; RPMB_KEY_SIZE]);

impl RpmbKey {
    pub fn new(bytes: [u8; RPMB_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Accepts exactly [`RPMB_KEY_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; RPMB_KEY_SIZE] = bytes.try_into().map_err(|_| {
            MmcError::precondition(format!(
                "RPMB key must be {} bytes, got {}",
                RPMB_KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; RPMB_KEY_SIZE] {
        &self.0
    }

    /// Start a streaming MAC keyed with this key.
    pub fn mac(&self) -> Result<FrameMac> {
        let inner = HmacSha256::new_from_slice(&self.0)
            .map_err(|e| MmcError::precondition(format!("Invalid RPMB key: {}", e)))?;
        Ok(FrameMac { inner })
    }

    /// One-shot MAC over `region`.
    pub fn sign(&self, region: &[u8]) -> Result<[u8; RPMB_MAC_SIZE]> {
        let mut mac = self.mac()?;
        mac.update(region);
        Ok(mac.finalize())
    }
}

impl std::fmt::Debug for RpmbKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RpmbKey(..)")
    }
}

/// Streaming HMAC-SHA256 context.
pub struct FrameMac {
    inner: HmacSha256,
}

impl FrameMac {
    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finalize(self) -> [u8; RPMB_MAC_SIZE] {
        self.inner.finalize().into_bytes().into()
    }

    /// Constant-time comparison against `expected`.
    pub fn verify(self, expected: &[u8]) -> bool {
        self.inner.verify_slice(expected).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4231 test case 2
    #[test]
    fn test_hmac_sha256_known_answer() {
        let key = b"Jefe";
        let mut mac = HmacSha256::new_from_slice(key).unwrap();
        mac.update(b"what do ya want for nothing?");
        let out = mac.finalize().into_bytes();
        assert_eq!(
            out[..8],
            [0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e]
        );
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let key = RpmbKey::new([0x42; RPMB_KEY_SIZE]);
        let region = [0xA5u8; 600];

        let mut streaming = key.mac().unwrap();
        streaming.update(&region[..284]);
        streaming.update(&region[284..]);

        let one_shot = key.sign(&region).unwrap();
        assert!(streaming.verify(&one_shot));
    }

    #[test]
    fn test_verify_rejects_wrong_mac() {
        let key = RpmbKey::new([1; RPMB_KEY_SIZE]);
        let mut tag = key.sign(b"payload").unwrap();
        tag[0] ^= 0x01;
        let mut mac = key.mac().unwrap();
        mac.update(b"payload");
        assert!(!mac.verify(&tag));
    }

    #[test]
    fn test_key_length_enforced() {
        assert!(RpmbKey::from_slice(&[0u8; 31]).is_err());
        assert!(RpmbKey::from_slice(&[0u8; 32]).is_ok());
    }
}
