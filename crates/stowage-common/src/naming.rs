//! Deterministic names for generated sub-resources
//!
//! Names are built from semantic parts plus an optional content hash and
//! are always valid RFC 1123 labels no longer than the requested bound.

use aws_lc_rs::digest;
use serde_json::Value;

use crate::{Error, Result};

/// Kubernetes object name limit for labels and most resource kinds
pub const MAX_NAME_LENGTH: usize = 63;

/// Number of hex characters of the content hash appended to a name
pub const HASH_SUFFIX_LENGTH: usize = 8;

/// Token used in place of a part that sanitizes to nothing
pub const EMPTY_PART_PLACEHOLDER: &str = "part";

/// Lowercase a value and map everything outside `[a-z0-9-]` to `-`.
///
/// Leading and trailing hyphens are trimmed and the result is capped at
/// [`MAX_NAME_LENGTH`]. May return an empty string.
pub fn sanitize(input: &str) -> String {
    let mapped: String = input
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let mut out = mapped.trim_matches('-').to_string();
    if out.len() > MAX_NAME_LENGTH {
        out.truncate(MAX_NAME_LENGTH);
        out = out.trim_end_matches('-').to_string();
    }
    out
}

/// Recursively sort maps and arrays so equal content serializes identically
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => {
            let mut items: Vec<Value> = items.iter().map(canonicalize).collect();
            items.sort_by_key(|v| v.to_string());
            Value::Array(items)
        }
        other => other.clone(),
    }
}

/// SHA-256 over the canonical form of `inputs`, as lowercase hex.
///
/// Input order does not affect the result.
pub fn content_hash(inputs: &[Value]) -> String {
    let mut encoded: Vec<String> = inputs.iter().map(|v| canonicalize(v).to_string()).collect();
    encoded.sort();
    let joined = encoded.join("|");
    let hash = digest::digest(&digest::SHA256, joined.as_bytes());
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Derive a DNS-safe, length-bounded name from `parts` and `hash_inputs`.
///
/// The result is `part-part-...[-hash]` where `hash` is the first
/// [`HASH_SUFFIX_LENGTH`] hex characters of [`content_hash`]. When the
/// joined name is longer than `max_len`, the longest part is cut one
/// character at a time until it fits. The hash suffix is never cut unless
/// every part is already a single character.
pub fn derive_name(parts: &[&str], hash_inputs: &[Value], max_len: usize) -> Result<String> {
    if parts.is_empty() {
        return Err(Error::validation("derive_name requires at least one part"));
    }
    if max_len == 0 || max_len > MAX_NAME_LENGTH {
        return Err(Error::validation(format!(
            "max name length must be between 1 and {MAX_NAME_LENGTH}, got {max_len}"
        )));
    }

    let mut tokens: Vec<String> = parts
        .iter()
        .map(|p| {
            let s = sanitize(p);
            if s.is_empty() {
                EMPTY_PART_PLACEHOLDER.to_string()
            } else {
                s
            }
        })
        .collect();

    let suffix = if hash_inputs.is_empty() {
        None
    } else {
        let mut hash = content_hash(hash_inputs);
        hash.truncate(HASH_SUFFIX_LENGTH);
        Some(hash)
    };

    let assemble = |tokens: &[String]| -> String {
        let mut all: Vec<&str> = tokens.iter().map(String::as_str).collect();
        if let Some(h) = &suffix {
            all.push(h);
        }
        all.join("-")
    };

    let mut name = assemble(&tokens);
    while name.len() > max_len {
        // Ties resolve to the earliest part so truncation is deterministic
        let Some((idx, longest)) = tokens
            .iter()
            .enumerate()
            .rev()
            .max_by_key(|(_, t)| t.len())
            .map(|(i, t)| (i, t.len()))
        else {
            break;
        };
        if longest <= 1 {
            break;
        }
        let token = &mut tokens[idx];
        token.truncate(longest - 1);
        let trimmed = token.trim_end_matches('-').to_string();
        *token = if trimmed.is_empty() {
            EMPTY_PART_PLACEHOLDER[..1].to_string()
        } else {
            trimmed
        };
        name = assemble(&tokens);
    }

    if name.len() > max_len {
        name.truncate(max_len);
        name = name.trim_end_matches('-').to_string();
    }

    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn is_dns_safe(s: &str) -> bool {
        s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    }

    #[test]
    fn same_inputs_yield_same_name() {
        let a = derive_name(&["svc", "cache"], &[json!("uid-123")], MAX_NAME_LENGTH).unwrap();
        let b = derive_name(&["svc", "cache"], &[json!("uid-123")], MAX_NAME_LENGTH).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("svc-cache-"));
        assert_eq!(a.len(), "svc-cache-".len() + HASH_SUFFIX_LENGTH);
        assert!(is_dns_safe(&a));
    }

    #[test]
    fn different_hash_inputs_change_the_suffix() {
        let a = derive_name(&["svc", "cache"], &[json!("uid-123")], MAX_NAME_LENGTH).unwrap();
        let b = derive_name(&["svc", "cache"], &[json!("uid-456")], MAX_NAME_LENGTH).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn no_hash_inputs_means_no_suffix() {
        let name = derive_name(&["My_Model", "Cache"], &[], MAX_NAME_LENGTH).unwrap();
        assert_eq!(name, "my-model-cache");
    }

    #[test]
    fn empty_parts_use_placeholder() {
        let name = derive_name(&["!!!", "cache"], &[], MAX_NAME_LENGTH).unwrap();
        assert_eq!(name, "part-cache");
    }

    #[test]
    fn map_key_order_does_not_affect_hash() {
        let a = content_hash(&[json!({"a": 1, "b": {"x": [1, 2], "y": 2}})]);
        let b = content_hash(&[json!({"b": {"y": 2, "x": [2, 1]}, "a": 1})]);
        assert_eq!(a, b);
    }

    #[test]
    fn argument_order_does_not_affect_hash() {
        let a = content_hash(&[json!("ns"), json!("uid")]);
        let b = content_hash(&[json!("uid"), json!("ns")]);
        assert_eq!(a, b);
    }

    #[test]
    fn long_names_are_truncated_but_keep_the_hash() {
        let long = "a-very-long-model-name-that-goes-on-and-on-well-beyond-any-reasonable-limit";
        let name = derive_name(&[long, "download"], &[json!("uid-1")], MAX_NAME_LENGTH).unwrap();
        assert!(name.len() <= MAX_NAME_LENGTH);
        assert!(is_dns_safe(&name));
        assert!(!name.ends_with('-'));

        let full_hash = content_hash(&[json!("uid-1")]);
        assert!(name.ends_with(&full_hash[..HASH_SUFFIX_LENGTH]));
        // The short semantic label survives, only the longest part shrinks
        assert!(name.contains("-download-"));
    }

    #[test]
    fn truncation_is_deterministic() {
        let long = "x".repeat(80);
        let a = derive_name(&[&long, &long], &[json!(1)], 30).unwrap();
        let b = derive_name(&[&long, &long], &[json!(1)], 30).unwrap();
        assert_eq!(a, b);
        assert!(a.len() <= 30);
    }

    #[test]
    fn length_bound_holds_even_when_parts_cannot_shrink() {
        let name = derive_name(&["a", "b", "c"], &[json!("uid")], 10).unwrap();
        assert!(name.len() <= 10);
        assert!(!name.ends_with('-'));
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        assert!(derive_name(&[], &[], MAX_NAME_LENGTH).is_err());
        assert!(derive_name(&["a"], &[], 0).is_err());
        assert!(derive_name(&["a"], &[], 64).is_err());
    }

    #[test]
    fn sanitize_maps_invalid_characters() {
        assert_eq!(sanitize("Llama 3.1/70B"), "llama-3-1-70b");
        assert_eq!(sanitize("--edge--"), "edge");
        assert_eq!(sanitize(&"a".repeat(100)).len(), MAX_NAME_LENGTH);
    }
}
