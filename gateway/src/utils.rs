use sha1::{Digest, Sha1};
use std::fmt::Write;

/// Lowercase hex SHA-1 of `data`. Cache keys and request fingerprints both
/// hash with SHA-1; the digests only need to be stable, not collision-proof.
pub fn sha1_hex(data: &[u8]) -> String {
    Sha1::digest(data)
        .iter()
        .fold(String::with_capacity(40), |mut acc, byte| {
            let _ = write!(acc, "{byte:02x}");
            acc
        })
}

/// Loggable preview of a credential. Never exposes more than the first
/// seven characters.
pub fn key_preview(key: &str) -> String {
    let prefix: String = key.chars().take(7).collect();
    if key.chars().count() > 7 {
        format!("{prefix}...")
    } else {
        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_hex_known_vector() {
        // sha1("abc")
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(sha1_hex(b"").len(), 40);
    }

    #[test]
    fn key_preview_truncates() {
        assert_eq!(key_preview("AIzaSyD-1234567890"), "AIzaSyD...");
        assert_eq!(key_preview("short"), "short");
        assert_eq!(key_preview(""), "");
    }
}
