//! HMAC URL token signing and verification.
//!
//! A token authorizes one `(uid, path)` pair until `expires`:
//! `base64url_nopad(HMAC-SHA256(secret, uid ":" path ":" expires))`.
//! Verification decodes the presented token and compares it against the
//! freshly computed tag in constant time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Sign a `(uid, path, expires)` triple. Used by tests and by operators
/// issuing links out of band.
pub fn sign(secret: &[u8], uid: &str, path: &str, expires: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(format!("{uid}:{path}:{expires}").as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Verify a presented token. `expires` must parse as an integer strictly
/// greater than `now`; the tag comparison is constant time.
pub fn verify(secret: &[u8], uid: &str, path: &str, expires: &str, token: &str, now: i64) -> bool {
    let Ok(expires_at) = expires.parse::<i64>() else {
        return false;
    };
    if expires_at <= now {
        return false;
    }
    let Ok(presented) = URL_SAFE_NO_PAD.decode(token.as_bytes()) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(format!("{uid}:{path}:{expires_at}").as_bytes());
    mac.verify_slice(&presented).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"S";

    #[test]
    fn test_round_trip() {
        let path = "/video/2025-06-17/ABC/index.m3u8";
        let token = sign(SECRET, "u", path, 9_999_999_999);
        assert!(verify(SECRET, "u", path, "9999999999", &token, 1_700_000_000));
    }

    #[test]
    fn test_tampered_token_denied() {
        let path = "/video/2025-06-17/ABC/index.m3u8";
        let token = sign(SECRET, "u", path, 9_999_999_999);
        let mut tampered = token.clone().into_bytes();
        tampered[0] = if tampered[0] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).expect("ascii");
        assert!(!verify(SECRET, "u", path, "9999999999", &tampered, 1_700_000_000));
    }

    #[test]
    fn test_any_field_change_denied() {
        let path = "/v/f.m3u8";
        let token = sign(SECRET, "u", path, 9_999_999_999);
        let now = 1_700_000_000;
        assert!(!verify(SECRET, "u2", path, "9999999999", &token, now));
        assert!(!verify(SECRET, "u", "/v/g.m3u8", "9999999999", &token, now));
        assert!(!verify(SECRET, "u", path, "9999999998", &token, now));
        assert!(!verify(b"other", "u", path, "9999999999", &token, now));
    }

    #[test]
    fn test_expired_denied() {
        let token = sign(SECRET, "u", "/v/f.m3u8", 100);
        assert!(!verify(SECRET, "u", "/v/f.m3u8", "100", &token, 100));
        assert!(!verify(SECRET, "u", "/v/f.m3u8", "100", &token, 101));
        assert!(verify(SECRET, "u", "/v/f.m3u8", "100", &token, 99));
    }

    #[test]
    fn test_garbage_inputs_denied() {
        assert!(!verify(SECRET, "u", "/v/f.m3u8", "soon", "token", 0));
        assert!(!verify(SECRET, "u", "/v/f.m3u8", "9999999999", "!!!not-base64!!!", 0));
        assert!(!verify(SECRET, "u", "/v/f.m3u8", "9999999999", "", 0));
    }
}
