//! Core types: Symbol, Timestamp

use std::fmt;

/// Maximum length of a symbol in bytes.
pub const MAX_SYMBOL_LEN: usize = 16;

/// Timestamp in milliseconds since the Unix epoch (UTC).
pub type Timestamp = i64;

/// Asset ticker symbol (e.g., `BTC`, `ETH`).
///
/// Stored inline as up to 16 ASCII bytes so it is `Copy` and cheap to hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol {
    len: u8,
    bytes: [u8; MAX_SYMBOL_LEN],
}

impl Symbol {
    /// Create a symbol, panicking on invalid input.
    ///
    /// Intended for literals in tests and examples; use [`Symbol::try_new`]
    /// for anything read from outside the process.
    pub fn new(s: &str) -> Self {
        match Self::try_new(s) {
            Some(sym) => sym,
            None => panic!("invalid symbol: {s:?}"),
        }
    }

    /// Create a symbol if `s` is 1..=16 printable ASCII bytes without whitespace.
    pub fn try_new(s: &str) -> Option<Self> {
        let raw = s.as_bytes();
        if raw.is_empty() || raw.len() > MAX_SYMBOL_LEN {
            return None;
        }
        if !raw.iter().all(|b| b.is_ascii_graphic()) {
            return None;
        }
        let mut bytes = [0u8; MAX_SYMBOL_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Self {
            len: raw.len() as u8,
            bytes,
        })
    }

    pub fn as_str(&self) -> &str {
        // Constructed only from validated ASCII.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl Ord for Symbol {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl PartialOrd for Symbol {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.as_str())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Symbol {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Symbol {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        Symbol::try_new(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid symbol: {s:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_round_trip() {
        let btc = Symbol::new("BTC");
        assert_eq!(btc.as_str(), "BTC");
        assert_eq!(format!("{btc}"), "BTC");
        assert_eq!(format!("{btc:?}"), "Symbol(BTC)");
    }

    #[test]
    fn symbol_rejects_invalid() {
        assert!(Symbol::try_new("").is_none());
        assert!(Symbol::try_new("BT C").is_none());
        assert!(Symbol::try_new("ABCDEFGHIJKLMNOPQ").is_none());
        assert!(Symbol::try_new("1000SHIB").is_some());
    }

    #[test]
    fn symbol_ordering_is_lexicographic() {
        assert!(Symbol::new("BTC") < Symbol::new("ETH"));
        assert!(Symbol::new("ETH") < Symbol::new("ETHW"));
        assert!(Symbol::new("AAVE") < Symbol::new("ZK"));
    }
}
