use sha2::{Digest, Sha256};

/// Integer seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// First 8 hex chars of SHA-256 of the User-Agent.
pub fn ua_hash(user_agent: &str) -> String {
    let digest = Sha256::digest(user_agent.as_bytes());
    hex_prefix(&digest, 8)
}

/// First 16 hex chars of SHA-256 of a URL path, used as the m3u8 counter
/// key fingerprint.
pub fn path_hash(path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

/// Case-insensitive suffix match against a configured extension list.
pub fn ends_with_any(path_lower: &str, suffixes: &[String]) -> bool {
    suffixes
        .iter()
        .any(|s| !s.is_empty() && path_lower.ends_with(&s.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ua_hash_is_8_hex_chars() {
        let h = ua_hash("Mozilla/5.0");
        assert_eq!(h.len(), 8);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        // Stable across calls.
        assert_eq!(h, ua_hash("Mozilla/5.0"));
        assert_ne!(h, ua_hash("Mozilla/5.1"));
    }

    #[test]
    fn test_path_hash_is_16_hex_chars() {
        assert_eq!(path_hash("/v/index.m3u8").len(), 16);
    }

    #[test]
    fn test_ends_with_any() {
        let exts = vec![".ts".to_string(), ".webp".to_string()];
        assert!(ends_with_any("/a/b/seg-001.ts", &exts));
        assert!(!ends_with_any("/a/b/index.m3u8", &exts));
        assert!(!ends_with_any("/a/b/file.tsx", &exts));
    }
}
