//! Canonical serialization and content hashing for [`PolicySet`] version
//! tracking (§6: "Canonical serialization for version hashing: all keys
//! sorted lexicographically").

use model::PolicySet;
use serde_json::Value;

use crate::PolicyError;

/// Serializes `value` with every object's keys sorted lexicographically,
/// recursively, producing a byte string stable across processes and runs.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(key.as_bytes());
                out.push(b':');
                write_canonical(&map[*key], out);
            }
            out.push(b'}');
        },
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        },
        other => out.extend_from_slice(other.to_string().as_bytes()),
    }
}

/// FNV-1a 64-bit hash, chosen over `DefaultHasher` because the latter is
/// explicitly documented to vary across Rust versions/processes and is
/// unsuitable for a stable version fingerprint.
fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Computes a stable content hash for a [`PolicySet`], used to detect
/// identical re-submissions of `loadPolicySet`.
pub fn content_hash(set: &PolicySet) -> Result<String, PolicyError> {
    let value = serde_json::to_value(set).map_err(|e| PolicyError::DocumentError(e.to_string()))?;
    let bytes = canonical_bytes(&value);
    Ok(format!("{:016x}", fnv1a_64(&bytes)))
}
