use serde_json::json;
use sha2::{Digest, Sha256};

use crate::record::CanonicalRecord;

/// Content fingerprint of a record's instruction/input/output triple.
///
/// SHA-256 over the canonical JSON serialization with keys in ascending
/// order. The hash choice is fixed for the life of a dedup store; changing it
/// invalidates every persisted store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut out = String::with_capacity(64);
        for &b in &self.0 {
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0f) as usize] as char);
        }
        out
    }
}

pub fn fingerprint_triple(instruction: &str, input: &str, output: &str) -> Fingerprint {
    // serde_json maps are BTree-backed, so the keys below serialize sorted
    // regardless of literal order.
    let doc = json!({
        "input": input,
        "instruction": instruction,
        "output": output,
    });
    let mut hasher = Sha256::new();
    hasher.update(doc.to_string().as_bytes());
    Fingerprint(hasher.finalize().into())
}

pub fn fingerprint(record: &CanonicalRecord) -> Fingerprint {
    fingerprint_triple(&record.instruction, &record.input, &record.output)
}

/// SHA-256 hex digest of arbitrary bytes; used for profile identity.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest: [u8; 32] = hasher.finalize().into();
    Fingerprint(digest).to_hex()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_triples_match() {
        let a = fingerprint_triple("hi", "", "hello");
        let b = fingerprint_triple("hi", "", "hello");
        assert_eq!(a, b);
    }

    #[test]
    fn any_field_change_diverges() {
        let base = fingerprint_triple("hi", "", "hello");
        assert_ne!(base, fingerprint_triple("hi!", "", "hello"));
        assert_ne!(base, fingerprint_triple("hi", "ctx", "hello"));
        assert_ne!(base, fingerprint_triple("hi", "", "hello!"));
    }

    #[test]
    fn field_swaps_do_not_collide() {
        // instruction/output swapped must hash differently.
        assert_ne!(
            fingerprint_triple("a", "", "b"),
            fingerprint_triple("b", "", "a")
        );
    }

    #[test]
    fn hex_is_lowercase_sha256() {
        let hex = sha256_hex(b"abc");
        assert_eq!(
            hex,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
