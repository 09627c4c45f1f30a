// hasher.rs — SHA-256 hashing and canonical JSON.
//
// All hashes in the ledger are SHA-256, hex-encoded. Anything that gets
// hashed or signed is first rendered as canonical JSON: object keys sorted
// bytewise at every depth, no insignificant whitespace, serde_json's number
// and string encoding. Two logically identical values therefore always
// produce identical bytes, whatever order their fields were built in.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::LedgerError;

/// `prev_hash` of the first receipt in every episode.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Hash arbitrary bytes, returning a lowercase hex-encoded SHA-256 string.
///
/// This is deterministic: the same input always produces the same output.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    // `format!("{:x}", ...)` produces lowercase hex
    format!("{:x}", result)
}

/// Hash a UTF-8 string, returning a lowercase hex-encoded SHA-256 string.
pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Render a JSON value in canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Serialize any value and render it in canonical form.
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, LedgerError> {
    let value = serde_json::to_value(value)?;
    Ok(canonical_json(&value))
}

/// SHA-256 over the canonical JSON of `value`.
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, LedgerError> {
    Ok(hash_str(&to_canonical_json(value)?))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Value::String's Display applies JSON string escaping.
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Merkle root over a list of hex receipt hashes.
///
/// Leaves and interior nodes are domain-separated (0x00 / 0x01 prefixes) so a
/// leaf can never be reinterpreted as an interior node. An odd node at the end
/// of a level is promoted unchanged. The root of an empty list is the hash of
/// the empty string.
pub fn merkle_root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return hash_str("");
    }

    let mut level: Vec<String> = leaves
        .iter()
        .map(|leaf| {
            let mut data = Vec::with_capacity(leaf.len() + 1);
            data.push(0x00);
            data.extend_from_slice(leaf.as_bytes());
            hash_bytes(&data)
        })
        .collect();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [left, right] => {
                    let mut data = Vec::with_capacity(left.len() + right.len() + 1);
                    data.push(0x01);
                    data.extend_from_slice(left.as_bytes());
                    data.extend_from_slice(right.as_bytes());
                    next.push(hash_bytes(&data));
                }
                [single] => next.push(single.clone()),
                _ => unreachable!("chunks(2) yields one or two items"),
            }
        }
        level = next;
    }

    level.remove(0)
}
