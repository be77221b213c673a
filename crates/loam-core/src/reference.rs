// Content references and canonical merkle hashing

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;
use crate::types::Fact;

const DIGEST_LEN: usize = 32;

/// Multibase prefix for unpadded base32-lower
const MULTIBASE_PREFIX: char = 'b';

/// RFC 4648 base32 alphabet, lowercase
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Encoded length: one prefix character plus ceil(256 / 5) digits
const ENCODED_LEN: usize = 53;

/// An opaque content hash over canonical form. Two values with identical
/// canonical form always produce identical references.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference([u8; DIGEST_LEN]);

impl Reference {
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    fn from_digest(digest: impl Into<[u8; DIGEST_LEN]>) -> Self {
        Reference(digest.into())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", MULTIBASE_PREFIX, base32_encode(&self.0))
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reference({self})")
    }
}

impl FromStr for Reference {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(MULTIBASE_PREFIX)
            .ok_or_else(|| StoreError::InvalidReference {
                detail: format!("missing '{MULTIBASE_PREFIX}' multibase prefix: {s:?}"),
            })?;
        let bytes = base32_decode(rest).ok_or_else(|| StoreError::InvalidReference {
            detail: format!("not base32-lower: {s:?}"),
        })?;
        let digest: [u8; DIGEST_LEN] =
            bytes
                .try_into()
                .map_err(|_| StoreError::InvalidReference {
                    detail: format!("expected {ENCODED_LEN} characters: {s:?}"),
                })?;
        Ok(Reference(digest))
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in bytes {
        acc = (acc << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn base32_decode(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    for c in s.bytes() {
        let digit = match c {
            b'a'..=b'z' => c - b'a',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        acc = (acc << 5) | u32::from(digit);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    // trailing bits must be zero padding
    if bits > 0 && acc & ((1 << bits) - 1) != 0 {
        return None;
    }
    Some(out)
}

/// Canonical merkle hash of a JSON value: primitives are leaves, arrays
/// and objects combine their children's digests, object keys sorted
/// lexicographically by codepoint.
pub fn hash_value(value: &Value) -> Reference {
    Reference::from_digest(digest_value(value))
}

/// Hash of a fact's logical content: discriminant + id + payload + parent
pub fn hash_fact(fact: &Fact) -> Reference {
    let body = match fact {
        Fact::Set { id, value, parent } => json!({
            "type": "set",
            "id": id,
            "value": value,
            "parent": parent,
        }),
        Fact::Patch { id, ops, parent } => json!({
            "type": "patch",
            "id": id,
            "ops": ops,
            "parent": parent,
        }),
        Fact::Delete { id, parent } => json!({
            "type": "delete",
            "id": id,
            "parent": parent,
        }),
    };
    hash_value(&body)
}

/// Plain SHA-256 over raw bytes; blob identity
pub fn hash_bytes(data: &[u8]) -> Reference {
    Reference::from_digest(Sha256::digest(data))
}

/// The sentinel parent for an entity's first fact: `hash({"id": id})`
pub fn empty_ref(id: &str) -> Reference {
    hash_value(&json!({ "id": id }))
}

fn digest_value(value: &Value) -> [u8; DIGEST_LEN] {
    match value {
        Value::Null => leaf(b"null", b""),
        Value::Bool(true) => leaf(b"bool:", b"true"),
        Value::Bool(false) => leaf(b"bool:", b"false"),
        Value::Number(n) => leaf(b"num:", canonical_number(n).as_bytes()),
        Value::String(s) => leaf(b"str:", s.as_bytes()),
        Value::Array(items) => {
            let mut hasher = Sha256::new();
            hasher.update(b"arr:");
            for item in items {
                hasher.update(digest_value(item));
            }
            hasher.finalize().into()
        }
        Value::Object(map) => {
            // sort explicitly rather than relying on the map's backing order
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            let mut hasher = Sha256::new();
            hasher.update(b"obj:");
            for key in keys {
                hasher.update(leaf(b"str:", key.as_bytes()));
                hasher.update(digest_value(&map[key]));
            }
            hasher.finalize().into()
        }
    }
}

/// Integers as plain decimal; non-integer reals as shortest round-trip
/// decimal. `1` and `1.0` hash identically.
fn canonical_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        i.to_string()
    } else if let Some(u) = n.as_u64() {
        u.to_string()
    } else {
        // f64 Display is the shortest representation that round-trips
        n.as_f64().map(|f| f.to_string()).unwrap_or_else(|| n.to_string())
    }
}

fn leaf(tag: &[u8], data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_values_equal_references() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": [true, null], "z": "s"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"z": "s", "y": [true, null], "x": 1}"#).unwrap();
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn test_distinct_values_distinct_references() {
        assert_ne!(hash_value(&json!({"a": 1})), hash_value(&json!({"a": 2})));
        assert_ne!(hash_value(&json!([1, 2])), hash_value(&json!([2, 1])));
        assert_ne!(hash_value(&json!("1")), hash_value(&json!(1)));
        assert_ne!(hash_value(&json!(null)), hash_value(&json!(false)));
    }

    #[test]
    fn test_number_canonicalization() {
        let int: Value = serde_json::from_str("1").unwrap();
        let real: Value = serde_json::from_str("1.0").unwrap();
        assert_eq!(hash_value(&int), hash_value(&real));
        assert_ne!(hash_value(&json!(1.5)), hash_value(&json!(1)));
    }

    #[test]
    fn test_reference_text_roundtrip() {
        let reference = hash_value(&json!({"n": 1}));
        let text = reference.to_string();
        assert!(text.starts_with('b'));
        assert_eq!(text.len(), ENCODED_LEN);
        assert!(text[1..].bytes().all(|c| BASE32_ALPHABET.contains(&c)));
        let parsed: Reference = text.parse().unwrap();
        assert_eq!(parsed, reference);
    }

    #[test]
    fn test_malformed_references_rejected() {
        let good = hash_value(&json!(1)).to_string();
        let cases = [
            String::new(),
            "zabc".to_string(),
            good[1..].to_string(),                // missing prefix
            good[..ENCODED_LEN - 1].to_string(),  // truncated
            format!("{good}a"),                   // too long
            good.to_uppercase(),
            // '0' is not in the alphabet
            "b0101010101010101010101010101010101010101010101010101".to_string(),
        ];
        for bad in &cases {
            assert!(
                Reference::from_str(bad).is_err(),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_serde_roundtrip() {
        let reference = hash_bytes(b"some bytes");
        let encoded = serde_json::to_string(&reference).unwrap();
        let decoded: Reference = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, reference);
    }

    #[test]
    fn test_hash_survives_json_roundtrip() {
        let value = json!({"a": [1, 2.5, "x"], "b": {"nested": true}, "c": null});
        let text = serde_json::to_string(&value).unwrap();
        let reparsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(hash_value(&value), hash_value(&reparsed));
    }

    #[test]
    fn test_empty_sentinel_distinct_per_entity() {
        assert_eq!(empty_ref("u:a"), empty_ref("u:a"));
        assert_ne!(empty_ref("u:a"), empty_ref("u:b"));
    }

    #[test]
    fn test_fact_hash_covers_parent() {
        let fact_a = Fact::Set {
            id: "u:a".to_string(),
            value: json!({"n": 1}),
            parent: empty_ref("u:a"),
        };
        let fact_b = Fact::Set {
            id: "u:a".to_string(),
            value: json!({"n": 1}),
            parent: hash_fact(&fact_a),
        };
        assert_ne!(hash_fact(&fact_a), hash_fact(&fact_b));
        assert_eq!(hash_fact(&fact_a), hash_fact(&fact_a.clone()));
    }

    #[test]
    fn test_fact_hash_covers_discriminant() {
        let parent = empty_ref("u:a");
        let set = Fact::Set {
            id: "u:a".to_string(),
            value: json!(null),
            parent,
        };
        let delete = Fact::Delete {
            id: "u:a".to_string(),
            parent,
        };
        assert_ne!(hash_fact(&set), hash_fact(&delete));
    }

    #[test]
    fn test_blob_hash_is_content_only() {
        assert_eq!(hash_bytes(b"png bytes"), hash_bytes(b"png bytes"));
        assert_ne!(hash_bytes(b"png bytes"), hash_bytes(b"other bytes"));
    }
}
