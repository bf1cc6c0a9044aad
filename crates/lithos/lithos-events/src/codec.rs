#![forbid(unsafe_code)]

//! Packs short symbols into a single `i32` cipher.
//!
//! A cipher with any of the [`VALID_CIPHER`] bits set carries the symbol
//! itself; every other non-zero value is reserved. Symbols that do not fit
//! the packing (too long, empty, or with characters outside `0x21..=0x5F`)
//! get cipher `0` and travel as strings next to it.

/// Bits that mark an `i32` as an encoded cipher.
pub const VALID_CIPHER: i32 = 0xC000_0000_u32 as i32;

/// Tag used by [`SymbolCodec::encode`] for packed symbols.
pub const ENCODED_CIPHER: i32 = 0x4000_0000;

const MAX_CHARS: usize = 5;
const BITS_PER_CHAR: u32 = 6;
const CHAR_MASK: i32 = 0x3F;
const FIRST_CHAR: u8 = 0x21;
const LAST_CHAR: u8 = 0x5F;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SymbolCodec;

impl SymbolCodec {
    pub fn new() -> Self {
        Self
    }

    /// Returns the cipher for `symbol`, or `0` when it cannot be packed.
    pub fn encode(&self, symbol: &str) -> i32 {
        let bytes = symbol.as_bytes();
        if bytes.is_empty() || bytes.len() > MAX_CHARS {
            return 0;
        }
        let mut packed = 0i32;
        for (i, &b) in bytes.iter().enumerate() {
            if !(FIRST_CHAR..=LAST_CHAR).contains(&b) {
                return 0;
            }
            let shift = BITS_PER_CHAR * (MAX_CHARS - 1 - i) as u32;
            packed |= ((b - 0x20) as i32) << shift;
        }
        ENCODED_CIPHER | packed
    }

    /// Unpacks an encoded cipher. Returns `None` for `0` and reserved values.
    pub fn decode(&self, cipher: i32) -> Option<String> {
        if cipher & VALID_CIPHER == 0 {
            return None;
        }
        let mut out = String::with_capacity(MAX_CHARS);
        for i in 0..MAX_CHARS {
            let shift = BITS_PER_CHAR * (MAX_CHARS - 1 - i) as u32;
            let c = (cipher >> shift) & CHAR_MASK;
            if c == 0 {
                break;
            }
            out.push((c as u8 + 0x20) as char);
        }
        Some(out)
    }

    /// Renders a (cipher, symbol) pair the way diagnostics print it.
    pub fn decode_pair(&self, cipher: i32, symbol: Option<&str>) -> String {
        match self.decode(cipher) {
            Some(s) => s,
            None => symbol.unwrap_or("").to_string(),
        }
    }

    pub fn is_encoded(&self, cipher: i32) -> bool {
        cipher & VALID_CIPHER != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_symbols_pack_and_unpack() {
        let codec = SymbolCodec::new();
        for s in ["IBM", "A", "MSFT", "ES#1", "AAPL.", "Z_9"] {
            let cipher = codec.encode(s);
            assert_ne!(cipher, 0, "{s} should be encodable");
            assert!(codec.is_encoded(cipher));
            assert_eq!(codec.decode(cipher).as_deref(), Some(s));
        }
    }

    /// Symbols that cannot be packed must come back as 0 so that callers
    /// route them through the mapping table instead.
    #[test]
    fn long_or_lowercase_symbols_are_not_encodable() {
        let codec = SymbolCodec::new();
        assert_eq!(codec.encode("GOOGLE"), 0);
        assert_eq!(codec.encode("ibm"), 0);
        assert_eq!(codec.encode(""), 0);
        assert_eq!(codec.encode("A B"), 0);
    }

    #[test]
    fn distinct_symbols_get_distinct_ciphers() {
        let codec = SymbolCodec::new();
        assert_ne!(codec.encode("AB"), codec.encode("BA"));
        assert_ne!(codec.encode("A"), codec.encode("AA"));
    }

    #[test]
    fn decode_pair_falls_back_to_string() {
        let codec = SymbolCodec::new();
        assert_eq!(codec.decode_pair(0, Some("GOOGLE")), "GOOGLE");
        assert_eq!(codec.decode_pair(codec.encode("IBM"), None), "IBM");
    }
}
