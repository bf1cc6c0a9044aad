//! Conversion between (cipher, symbol) pairs and matrix keys.
//!
//! A symbol short enough to be packed into a cipher is its own key. Any
//! other symbol is interned in the [`Mapper`] and keyed by its mapping key.

use crate::CollectorError;
use basalt_matrix::Mapper;
use basalt_matrix::mapper::is_mapped_key;
use lithos_events::{DataRecord, VALID_CIPHER};
use std::sync::Arc;

/// Key of an existing pair, or `0` when the symbol was never mapped.
pub fn resolve_key(mapper: &Mapper, record: &DataRecord, cipher: i32, symbol: Option<&str>) -> Result<i32, CollectorError> {
    if cipher & VALID_CIPHER != 0 {
        return Ok(cipher);
    }
    if cipher != 0 {
        return Err(CollectorError::ReservedCipher { cipher });
    }
    match symbol {
        Some(symbol) => Ok(mapper.get_key(symbol)),
        None => Err(CollectorError::MissingSymbol {
            record: record.name().to_string(),
        }),
    }
}

/// Like [`resolve_key`] but maps the symbol if needed.
pub fn add_key(mapper: &Mapper, record: &DataRecord, cipher: i32, symbol: Option<&str>) -> Result<i32, CollectorError> {
    match resolve_key(mapper, record, cipher, symbol)? {
        0 => match symbol {
            Some(symbol) => Ok(mapper.add_key(symbol)?),
            None => Err(CollectorError::MissingSymbol {
                record: record.name().to_string(),
            }),
        },
        key => Ok(key),
    }
}

/// Cipher and symbol a cursor for `key` should carry.
pub fn decode_key(mapper: &Mapper, key: i32) -> (i32, Option<Arc<str>>) {
    if is_mapped_key(key) {
        (0, mapper.get_symbol(key))
    } else {
        (key, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lithos_events::DataScheme;

    #[test]
    fn ciphers_are_keys_and_long_symbols_are_mapped() {
        let scheme = DataScheme::builder().record("Quote", 1, 0).build();
        let quote = scheme.record(0).unwrap();
        let mapper = Mapper::new().unwrap();
        let short = scheme.cursor(quote, "IBM");
        let key = add_key(&mapper, quote, short.cipher(), short.symbol()).unwrap();
        assert_eq!(key, short.cipher());
        assert_eq!(decode_key(&mapper, key), (key, None));

        let long = scheme.cursor(quote, "MSFT_CALL_2030");
        assert_eq!(resolve_key(&mapper, quote, 0, long.symbol()).unwrap(), 0);
        let key = add_key(&mapper, quote, 0, long.symbol()).unwrap();
        assert!(is_mapped_key(key));
        assert_eq!(resolve_key(&mapper, quote, 0, long.symbol()).unwrap(), key);
        assert_eq!(decode_key(&mapper, key).1.as_deref(), Some("MSFT_CALL_2030"));
    }

    #[test]
    fn reserved_cipher_is_rejected() {
        let scheme = DataScheme::builder().record("Quote", 1, 0).build();
        let quote = scheme.record(0).unwrap();
        let mapper = Mapper::new().unwrap();
        let err = resolve_key(&mapper, quote, 0x1234, None).unwrap_err();
        assert!(matches!(err, CollectorError::ReservedCipher { cipher: 0x1234 }));
        assert!(err.is_fatal());
    }
}
