//! Passphrase to volume-key expansion.
//!
//! Two SHA-256 rounds fill a 64-byte key: the first half is the digest of the
//! passphrase, the second half the digest of the first half. There is no salt
//! and no work factor; the key is re-derived on every activation so the
//! expansion has to be deterministic.

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the derived volume key in bytes.
pub const VOLUME_KEY_LEN: usize = 64;
const HALF: usize = VOLUME_KEY_LEN / 2;

/// In-memory volume key. Wiped on drop and never written to disk.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VolumeKey([u8; VOLUME_KEY_LEN]);

impl VolumeKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for VolumeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VolumeKey(<redacted>)")
    }
}

/// Derive the volume key for `passphrase`.
pub fn derive_volume_key(passphrase: &[u8]) -> VolumeKey {
    let mut key = VolumeKey([0u8; VOLUME_KEY_LEN]);
    let (first, second) = key.0.split_at_mut(HALF);
    first.copy_from_slice(&Sha256::digest(passphrase));
    second.copy_from_slice(&Sha256::digest(&*first));
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_volume_key(b"correcthorse");
        let b = derive_volume_key(b"correcthorse");
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.as_bytes().len(), VOLUME_KEY_LEN);
    }

    #[test]
    fn halves_differ_and_second_rehashes_first() {
        let cases: [&[u8]; 4] = [b"", b"123456", b"correcthorse", &[0u8; 200]];
        for passphrase in cases {
            let key = derive_volume_key(passphrase);
            let (first, second) = key.as_bytes().split_at(HALF);
            assert_ne!(first, second);
            assert_eq!(second, Sha256::digest(first).as_slice());
        }
    }

    #[test]
    fn first_half_matches_known_sha256() {
        let key = derive_volume_key(b"abc");
        assert_eq!(
            hex::encode(&key.as_bytes()[..HALF]),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn different_passphrases_yield_different_keys() {
        let a = derive_volume_key(b"alpha");
        let b = derive_volume_key(b"bravo");
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = derive_volume_key(b"secret");
        assert_eq!(format!("{key:?}"), "VolumeKey(<redacted>)");
    }
}
