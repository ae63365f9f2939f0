use sha2::{Digest, Sha256};

/// Lowercase hex sha256 of `content`.
pub fn content_digest(content: &[u8]) -> String {
    let hash = Sha256::digest(content);
    let mut out = String::with_capacity(hash.len() * 2);
    for byte in hash.iter() {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Cache key of a sub-resource url.
pub fn resource_id(url: &str) -> String {
    content_digest(url.as_bytes())
}

/// True when `content` hashes to `expected`. An empty expectation never verifies.
pub fn verify(content: &[u8], expected: &str) -> bool {
    !expected.is_empty() && content_digest(content).eq_ignore_ascii_case(expected)
}
