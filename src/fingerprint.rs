//! Deterministic SHA-256 fingerprints over datasets.
//!
//! A fingerprint identifies the exact price data an optimization ran on. It
//! keys the covariance cache and is recorded in every audit record as the
//! input data hash.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::types::{Symbol, Timestamp};

/// 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Lowercase hex encoding (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Fingerprint of an arbitrary byte string.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}..)", &self.to_hex()[..12])
    }
}

/// Incremental fingerprint builder.
///
/// Every field is written with a fixed-width little-endian encoding and
/// symbols are length-prefixed, so distinct datasets cannot collide by
/// concatenation.
#[derive(Clone, Default)]
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbol(&mut self, symbol: &Symbol) -> &mut Self {
        let s = symbol.as_str().as_bytes();
        self.hasher.update([s.len() as u8]);
        self.hasher.update(s);
        self
    }

    pub fn timestamp(&mut self, ts: Timestamp) -> &mut Self {
        self.hasher.update(ts.to_le_bytes());
        self
    }

    /// Hash the exact bit pattern, so `0.1 + 0.2` and `0.3` differ.
    pub fn value(&mut self, v: f64) -> &mut Self {
        self.hasher.update(v.to_bits().to_le_bytes());
        self
    }

    pub fn count(&mut self, n: usize) -> &mut Self {
        self.hasher.update((n as u64).to_le_bytes());
        self
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_64_chars() {
        let fp = Fingerprint::of_bytes(b"abc");
        assert_eq!(
            fp.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(format!("{fp}").len(), 64);
    }

    #[test]
    fn builder_is_order_sensitive() {
        let mut a = FingerprintBuilder::new();
        a.symbol(&Symbol::new("BTC")).value(1.0).value(2.0);
        let mut b = FingerprintBuilder::new();
        b.symbol(&Symbol::new("BTC")).value(2.0).value(1.0);
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn length_prefix_prevents_concatenation_collisions() {
        let mut a = FingerprintBuilder::new();
        a.symbol(&Symbol::new("AB")).symbol(&Symbol::new("C"));
        let mut b = FingerprintBuilder::new();
        b.symbol(&Symbol::new("A")).symbol(&Symbol::new("BC"));
        assert_ne!(a.finish(), b.finish());
    }
}
