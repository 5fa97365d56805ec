//! Reversible obfuscation of report IDs.
//!
//! Allocated report IDs trend with wall-clock time and embed the node ID, so
//! handing them out as-is would leak both. [`IdCipher`] runs each ID through a
//! single DES block (no chaining, no IV, no padding): a keyed permutation of the
//! 64-bit space. It is deterministic and provides obscurity only, not
//! confidentiality or authentication.

use des::Des;
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

use crate::config::ConfigError;

/// Length of the DES key in bytes.
pub const KEY_LEN: usize = 8;

/// Keyed bijection between internal `u64` report IDs and external `i64` IDs.
pub struct IdCipher {
    block: Des,
}

impl std::fmt::Debug for IdCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdCipher").finish_non_exhaustive()
    }
}

impl IdCipher {
    /// Creates a cipher from a hex-encoded key.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidKey` if the key is not valid hex or does
    /// not decode to exactly [`KEY_LEN`] bytes.
    pub fn new(hex_key: &str) -> Result<Self, ConfigError> {
        let key = hex::decode(hex_key.trim())
            .map_err(|e| ConfigError::InvalidKey(format!("not valid hex: {e}")))?;
        if key.len() != KEY_LEN {
            return Err(ConfigError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let block = Des::new_from_slice(&key)
            .map_err(|e| ConfigError::InvalidKey(e.to_string()))?;
        Ok(IdCipher { block })
    }

    /// Maps an internal ID to its external form.
    ///
    /// The result keeps all 64 bits of the encrypted block, so negative
    /// values are expected.
    pub fn encrypt(&self, n: u64) -> i64 {
        let mut block = GenericArray::from(n.to_be_bytes());
        self.block.encrypt_block(&mut block);
        u64::from_be_bytes(to_array(&block)) as i64
    }

    /// Maps an external ID back to the internal one.
    pub fn decrypt(&self, n: i64) -> u64 {
        let mut block = GenericArray::from((n as u64).to_be_bytes());
        self.block.decrypt_block(&mut block);
        u64::from_be_bytes(to_array(&block))
    }
}

fn to_array(block: &[u8]) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(block);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: &str = "0123456789abcdef";

    fn cipher() -> IdCipher {
        IdCipher::new(KEY).unwrap()
    }

    proptest! {
        #[test]
        fn decrypt_inverts_encrypt(n in any::<u64>()) {
            let c = cipher();
            prop_assert_eq!(c.decrypt(c.encrypt(n)), n);
        }

        #[test]
        fn encrypt_inverts_decrypt(n in any::<i64>()) {
            let c = cipher();
            prop_assert_eq!(c.encrypt(c.decrypt(n)), n);
        }

        #[test]
        fn encrypt_is_deterministic(n in any::<u64>()) {
            prop_assert_eq!(cipher().encrypt(n), cipher().encrypt(n));
        }

        #[test]
        fn distinct_inputs_stay_distinct(a in any::<u64>(), b in any::<u64>()) {
            prop_assume!(a != b);
            let c = cipher();
            prop_assert_ne!(c.encrypt(a), c.encrypt(b));
        }
    }

    #[test]
    fn boundary_values_roundtrip() {
        let c = cipher();
        for n in [0, 1, u64::MAX, u64::MAX - 1, 1 << 63, (1 << 63) - 1] {
            assert_eq!(c.decrypt(c.encrypt(n)), n, "roundtrip failed for {n}");
        }
    }

    #[test]
    fn sequential_ids_are_scrambled() {
        let c = cipher();
        let a = c.encrypt(1_000_000);
        let b = c.encrypt(1_000_001);
        assert_ne!(a.wrapping_add(1), b);
    }

    #[test]
    fn different_keys_give_different_outputs() {
        let other = IdCipher::new("fedcba9876543210").unwrap();
        assert_ne!(cipher().encrypt(42), other.encrypt(42));
    }

    #[test]
    fn uppercase_hex_is_accepted() {
        let upper = IdCipher::new("0123456789ABCDEF").unwrap();
        assert_eq!(upper.encrypt(7), cipher().encrypt(7));
    }

    #[test]
    fn rejects_non_hex_key() {
        assert!(matches!(
            IdCipher::new("not-hex-at-all!!"),
            Err(ConfigError::InvalidKey(_))
        ));
    }

    #[test]
    fn rejects_wrong_key_length() {
        assert!(matches!(IdCipher::new("0123"), Err(ConfigError::InvalidKey(_))));
        assert!(matches!(
            IdCipher::new("0123456789abcdef0123456789abcdef"),
            Err(ConfigError::InvalidKey(_))
        ));
        assert!(matches!(IdCipher::new(""), Err(ConfigError::InvalidKey(_))));
    }
}
