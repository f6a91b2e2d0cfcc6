//! Key codec helpers
//!
//! Region keys on the wire are memcomparable-encoded byte strings. This module
//! provides:
//! - Hex serde adapters for byte keys in JSON documents
//! - Memcomparable encode/decode of byte groups
//! - Table id extraction for table-keyed regions

use crate::error::{Result, ShardplanError};

const ENC_GROUP_SIZE: usize = 8;
const ENC_MARKER: u8 = 0xFF;
const ENC_PAD: u8 = 0x00;
const SIGN_MASK: u64 = 0x8000_0000_0000_0000;
const TABLE_PREFIX: &[u8] = b"t";

/// Serde adapter storing `Vec<u8>` keys as lowercase hex strings
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Upper-case hex rendering used in log lines and operator briefs
pub fn hex_key(key: &[u8]) -> String {
    hex::encode_upper(key)
}

/// Encode bytes so that the encoded form preserves byte ordering
pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
    let groups = data.len() / ENC_GROUP_SIZE + 1;
    let mut out = Vec::with_capacity(groups * (ENC_GROUP_SIZE + 1));

    let mut idx = 0;
    while idx <= data.len() {
        let remain = data.len() - idx;
        if remain >= ENC_GROUP_SIZE {
            out.extend_from_slice(&data[idx..idx + ENC_GROUP_SIZE]);
            out.push(ENC_MARKER);
        } else {
            let pad = ENC_GROUP_SIZE - remain;
            out.extend_from_slice(&data[idx..]);
            out.extend(std::iter::repeat(ENC_PAD).take(pad));
            out.push(ENC_MARKER - pad as u8);
        }
        idx += ENC_GROUP_SIZE;
    }

    out
}

/// Decode memcomparable bytes, returning the decoded value and the rest of the input
pub fn decode_bytes(mut data: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    let mut out = Vec::with_capacity(data.len());

    loop {
        if data.len() < ENC_GROUP_SIZE + 1 {
            return Err(ShardplanError::Codec("insufficient bytes to decode".into()));
        }

        let (group, rest) = data.split_at(ENC_GROUP_SIZE + 1);
        let marker = group[ENC_GROUP_SIZE];
        let pad = (ENC_MARKER - marker) as usize;
        if pad > ENC_GROUP_SIZE {
            return Err(ShardplanError::Codec(format!("invalid marker byte {marker:#x}")));
        }

        let real = ENC_GROUP_SIZE - pad;
        out.extend_from_slice(&group[..real]);
        data = rest;

        if pad != 0 {
            if group[real..ENC_GROUP_SIZE].iter().any(|b| *b != ENC_PAD) {
                return Err(ShardplanError::Codec("invalid padding".into()));
            }
            return Ok((out, data));
        }
    }
}

/// Encode a signed integer in comparable big-endian form
pub fn encode_int(v: i64) -> [u8; 8] {
    ((v as u64) ^ SIGN_MASK).to_be_bytes()
}

/// Decode an integer written by [`encode_int`]
pub fn decode_int(data: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = data
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ShardplanError::Codec("insufficient bytes to decode int".into()))?;
    Ok((u64::from_be_bytes(bytes) ^ SIGN_MASK) as i64)
}

/// Table id of an encoded region key, 0 when the key is not a table key
pub fn table_id(key: &[u8]) -> i64 {
    let Ok((decoded, _)) = decode_bytes(key) else {
        return 0;
    };
    match decoded.strip_prefix(TABLE_PREFIX) {
        Some(rest) => decode_int(rest).unwrap_or(0),
        None => 0,
    }
}

/// Build the encoded start key of a table, mostly used by tests and fixtures
pub fn table_key(table: i64, suffix: &[u8]) -> Vec<u8> {
    let mut raw = TABLE_PREFIX.to_vec();
    raw.extend_from_slice(&encode_int(table));
    raw.extend_from_slice(suffix);
    encode_bytes(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_bytes_padding() {
        assert_eq!(
            encode_bytes(b""),
            vec![0, 0, 0, 0, 0, 0, 0, 0, 0xF7]
        );
        assert_eq!(
            encode_bytes(b"abc"),
            vec![b'a', b'b', b'c', 0, 0, 0, 0, 0, 0xFA]
        );
        // A full group is followed by an empty padded group
        assert_eq!(encode_bytes(b"12345678").len(), 18);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_bytes(b"short").is_err());
        assert!(decode_bytes(&[1, 2, 3, 4, 5, 6, 7, 8, 0x10]).is_err());
    }

    #[test]
    fn test_table_id() {
        assert_eq!(table_id(&table_key(42, b"_r")), 42);
        assert_eq!(table_id(&table_key(-7, b"")), -7);
        assert_eq!(table_id(b""), 0);
        assert_eq!(table_id(&encode_bytes(b"xyz")), 0);
    }

    #[test]
    fn test_hex_key_upper() {
        assert_eq!(hex_key(&[0xab, 0x01]), "AB01");
    }

    proptest! {
        #[test]
        fn prop_encoded_bytes_keep_order(a in proptest::collection::vec(any::<u8>(), 0..20),
                                         b in proptest::collection::vec(any::<u8>(), 0..20)) {
            prop_assert_eq!(a.cmp(&b), encode_bytes(&a).cmp(&encode_bytes(&b)));
            let encoded = encode_bytes(&a);
            let (decoded, rest) = decode_bytes(&encoded).unwrap();
            prop_assert_eq!(decoded, a);
            prop_assert!(rest.is_empty());
        }
    }
}
