//! One-way digests shared by the Privacy Engine (`hash`/`tokenize` PII
//! actions) and the Context Store (deterministic memory ids).

use sha2::{Digest, Sha256};

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
