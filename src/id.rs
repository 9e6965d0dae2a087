//! Opaque job identifiers.
//!
//! Ids are 8-character lowercase-alphanumeric tokens, generated the same way
//! the teacher generates run names (`rand`-driven, retried by the caller on
//! collision) but fixed-width and alphabet-restricted so they round-trip
//! cleanly through the batch-file dependency grammar (`after=<id>`).

use rand::Rng;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
pub const ID_LEN: usize = 8;

/// Generate a fresh random id. Not guaranteed unique — callers (the store)
/// retry on a primary-key collision.
pub fn generate() -> String {
    let mut rng = rand::rng();
    (0..ID_LEN)
        .map(|_| {
            let idx = rng.random_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

/// Whether `s` looks like a bare job id: exactly [`ID_LEN`] alphanumeric
/// characters. Used by the (out-of-scope) batch-file parser to distinguish a
/// literal id from a `name` reference; exposed here because the contract is
/// part of the store's id format, not the parser's.
pub fn looks_like_id(s: &str) -> bool {
    s.len() == ID_LEN && s.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_fixed_width_alphanumeric_ids() {
        for _ in 0..100 {
            let id = generate();
            assert_eq!(id.len(), ID_LEN);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(looks_like_id(&id));
        }
    }

    #[test]
    fn rejects_non_id_tokens() {
        assert!(!looks_like_id("short"));
        assert!(!looks_like_id("toolongtoken"));
        assert!(!looks_like_id("has-dash!"));
    }
}
