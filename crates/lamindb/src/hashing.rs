use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;

use crate::{Error, Result};

/// Deterministic digest over a set of identifiers:
/// - sort bytewise, dropping duplicates
/// - hash bytes: the identifiers joined with ":"
pub fn hash_set<I, T>(members: I) -> String
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    let mut sorted: Vec<String> = members.into_iter().map(|m| m.as_ref().to_string()).collect();
    sorted.sort();
    sorted.dedup();

    let mut hasher = blake3::Hasher::new();
    for (i, m) in sorted.iter().enumerate() {
        if i > 0 {
            hasher.update(b":");
        }
        hasher.update(m.as_bytes());
    }
    hex::encode(hasher.finalize().as_bytes())
}

/// Content hash of an in-memory data object from its canonical bytes (bincode).
pub fn hash_object<T: Serialize>(object: &T) -> Result<(String, u64)> {
    let bytes = bincode::serialize(object).map_err(|e| Error::Ser(e.to_string()))?;
    Ok((hex::encode(blake3::hash(&bytes).as_bytes()), bytes.len() as u64))
}

/// Random 20-character base62 identifier.
pub fn base62_20() -> String {
    base62(20)
}

const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Deterministic base62 identifier derived from `key`, at most 32 characters.
pub fn uid_from_key(key: &str, n: usize) -> String {
    blake3::hash(key.as_bytes())
        .as_bytes()
        .iter()
        .take(n)
        .map(|b| BASE62[(*b as usize) % BASE62.len()] as char)
        .collect()
}

pub fn base62(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    #[test]
    fn test_hash_set_order_independent() {
        let mut ids = vec!["fc7Ra1", "x9", "a0", "Zeta", "b1", "0"];
        let expected = hash_set(&ids);
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            ids.shuffle(&mut rng);
            assert_eq!(hash_set(&ids), expected);
        }
    }

    #[test]
    fn test_hash_set_changes_with_membership() {
        assert_ne!(hash_set(["a", "b"]), hash_set(["a", "c"]));
        assert_ne!(hash_set(["a", "b"]), hash_set(["ab"]));
        assert_eq!(hash_set(["a", "b", "a"]), hash_set(["b", "a"]));
    }

    #[test]
    fn test_uid_from_key_is_stable() {
        assert_eq!(uid_from_key("CL:0000084", 12), uid_from_key("CL:0000084", 12));
        assert_ne!(uid_from_key("CL:0000084", 12), uid_from_key("CL:0000542", 12));
        assert_eq!(uid_from_key("x", 12).len(), 12);
    }

    #[test]
    fn test_base62_shape() {
        let uid = base62_20();
        assert_eq!(uid.len(), 20);
        assert!(uid.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(uid, base62_20());
    }
}
