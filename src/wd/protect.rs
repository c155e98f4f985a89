use crate::wd::config::lookup_dotted;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::fmt::Write as _;

type HmacSha256 = Hmac<Sha256>;

const SECTIONS_KEY: &str = "protectedSections";
const SECTIONS_HASH_KEY: &str = "protectedSectionsHash";

#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("'protectedSections' must be an array of {{sectionName, hash}} objects")]
    MalformedIndex,
    #[error("'protectedSectionsHash' is missing")]
    MissingIndexHash,
    #[error("section path '{0}' not found in configuration")]
    SectionNotFound(String),
    #[error("protected sections index has been tampered with")]
    IndexHashMismatch,
    #[error("hash verification failed for protected section '{0}'")]
    SectionHashMismatch(String),
}

/// Compact, key-sorted JSON serialization. Two implementations hashing the
/// same tree must agree byte-for-byte, so the sort is done here explicitly
/// instead of relying on the map representation underneath.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}", Value::String((*key).clone()));
                out.push(':');
                write_canonical(&map[key.as_str()], out);
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
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

fn hmac_hex(message: &str, password: &str) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(password.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    let digest = mac.finalize().into_bytes();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

fn section_names(root: &Value) -> Result<Vec<String>, IntegrityError> {
    let sections = root
        .get(SECTIONS_KEY)
        .and_then(Value::as_array)
        .ok_or(IntegrityError::MalformedIndex)?;
    sections
        .iter()
        .map(|entry| {
            entry
                .get("sectionName")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(IntegrityError::MalformedIndex)
        })
        .collect()
}

/// Computes HMAC-SHA256 hashes for every entry of `protectedSections` and for
/// the finalized array itself, writing the lowercase hex digests into the
/// tree (`entry.hash` and `protectedSectionsHash`).
pub fn protect_json(root: &mut Value, password: &str) -> Result<(), IntegrityError> {
    let names = section_names(root)?;

    let mut hashes = Vec::with_capacity(names.len());
    for name in &names {
        let section = lookup_dotted(root, name)
            .ok_or_else(|| IntegrityError::SectionNotFound(name.clone()))?;
        hashes.push(hmac_hex(&canonical_json(section), password));
    }

    let sections = root
        .get_mut(SECTIONS_KEY)
        .and_then(Value::as_array_mut)
        .ok_or(IntegrityError::MalformedIndex)?;
    for (entry, hash) in sections.iter_mut().zip(hashes) {
        let obj = entry.as_object_mut().ok_or(IntegrityError::MalformedIndex)?;
        obj.insert("hash".to_string(), Value::String(hash));
    }

    let index_hash = {
        let sections = root.get(SECTIONS_KEY).ok_or(IntegrityError::MalformedIndex)?;
        hmac_hex(&canonical_json(sections), password)
    };
    root.as_object_mut()
        .ok_or(IntegrityError::MalformedIndex)?
        .insert(SECTIONS_HASH_KEY.to_string(), Value::String(index_hash));
    Ok(())
}

/// Recomputes and compares all hashes. The array-level hash is verified
/// first: a tampered index is fatal before any per-section check runs.
pub fn verify_json_protection(root: &Value, password: &str) -> Result<(), IntegrityError> {
    let sections = root
        .get(SECTIONS_KEY)
        .and_then(Value::as_array)
        .ok_or(IntegrityError::MalformedIndex)?;
    let stored_index_hash = root
        .get(SECTIONS_HASH_KEY)
        .and_then(Value::as_str)
        .ok_or(IntegrityError::MissingIndexHash)?;

    let index_value = root.get(SECTIONS_KEY).ok_or(IntegrityError::MalformedIndex)?;
    if hmac_hex(&canonical_json(index_value), password) != stored_index_hash {
        return Err(IntegrityError::IndexHashMismatch);
    }

    for entry in sections {
        let name = entry
            .get("sectionName")
            .and_then(Value::as_str)
            .ok_or(IntegrityError::MalformedIndex)?;
        let stored_hash = entry
            .get("hash")
            .and_then(Value::as_str)
            .ok_or(IntegrityError::MalformedIndex)?;
        let section = lookup_dotted(root, name)
            .ok_or_else(|| IntegrityError::SectionNotFound(name.to_string()))?;
        if hmac_hex(&canonical_json(section), password) != stored_hash {
            return Err(IntegrityError::SectionHashMismatch(name.to_string()));
        }
    }
    Ok(())
}
