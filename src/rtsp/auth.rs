//! RTSP authentication primitives
//!
//! Digest per RFC 2069 as RTSP clients implement it:
//! `response = MD5(HA1:nonce:MD5(method:uri))` with
//! `HA1 = MD5(user:realm:password)`. A pre-hashed password is HA1 itself.
//! Basic is the usual base64 `user:password`. The session drives the
//! challenge flow; this module does the string work.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use rand::Rng;

pub fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Random alphanumeric string, for session ids and digest nonces
pub fn rand_string(len: usize) -> String {
    const CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Split an `Authorization` value into scheme and the rest
pub fn split_auth_header(value: &str) -> Option<(&str, &str)> {
    let value = value.trim();
    let (scheme, rest) = value.split_once(' ')?;
    let rest = rest.trim();
    if scheme.is_empty() || rest.is_empty() {
        return None;
    }
    Some((scheme, rest))
}

/// Parse the comma-separated `k=v` fields of a Digest header; values may be
/// quoted
pub fn parse_digest_fields(rest: &str) -> HashMap<String, String> {
    rest.split(',')
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| {
            (
                k.trim().trim_matches('"').to_string(),
                v.trim().trim_matches('"').to_string(),
            )
        })
        .collect()
}

/// `HA1 = MD5(user:realm:password)`
pub fn ha1(user: &str, realm: &str, password: &str) -> String {
    md5_hex(&format!("{user}:{realm}:{password}"))
}

/// Expected digest response for a request
pub fn digest_response(ha1: &str, nonce: &str, method: &str, uri: &str) -> String {
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

/// Verify a client digest. `encrypted` marks `password` as HA1 already.
pub fn check_digest(
    user: &str,
    realm: &str,
    password: &str,
    encrypted: bool,
    nonce: &str,
    method: &str,
    uri: &str,
    response: &str,
) -> bool {
    let ha1 = if encrypted {
        password.to_string()
    } else {
        ha1(user, realm, password)
    };
    let expected = digest_response(&ha1, nonce, method, uri);
    // MD5 hex digests compare case-insensitively
    expected.eq_ignore_ascii_case(response)
}

/// Decode Basic credentials into `(user, password)`
pub fn basic_credentials(encoded: &str) -> Option<(String, String)> {
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, password) = text.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Fresh 32-character digest nonce
pub fn make_nonce() -> String {
    rand_string(32)
}

/// Fresh 12-character session identifier
pub fn make_session_id() -> String {
    rand_string(12)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_known_answer() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn rand_string_shape() {
        let id = make_session_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(make_nonce().len(), 32);
        assert_ne!(make_nonce(), make_nonce());
    }

    #[test]
    fn split_auth() {
        assert_eq!(split_auth_header("Basic dXNlcjpwd2Q="), Some(("Basic", "dXNlcjpwd2Q=")));
        let (scheme, rest) = split_auth_header("Digest realm=\"R\", nonce=\"N\"").unwrap();
        assert_eq!(scheme, "Digest");
        assert!(rest.starts_with("realm"));
        assert!(split_auth_header("Basic").is_none());
    }

    #[test]
    fn digest_fields_quoted_or_bare() {
        let fields = parse_digest_fields("username=\"alice\", realm=\"R\",nonce=abcd, uri=\"rtsp://h/s\", response=\"ff\"");
        assert_eq!(fields["username"], "alice");
        assert_eq!(fields["nonce"], "abcd");
        assert_eq!(fields["uri"], "rtsp://h/s");
    }

    #[test]
    fn digest_known_chain() {
        // Hand-computable chain: expected = MD5(HA1:nonce:MD5(DESCRIBE:uri))
        let user = "alice";
        let realm = "studio";
        let password = "secret";
        let nonce = "0123456789abcdef0123456789abcdef";
        let uri = "rtsp://h/live/cam";

        let expected = digest_response(&ha1(user, realm, password), nonce, "DESCRIBE", uri);
        assert!(check_digest(user, realm, password, false, nonce, "DESCRIBE", uri, &expected));
        assert!(check_digest(user, realm, password, false, nonce, "DESCRIBE", uri, &expected.to_uppercase()));

        // Pre-hashed password is HA1 directly
        let pre = ha1(user, realm, password);
        assert!(check_digest(user, realm, &pre, true, nonce, "DESCRIBE", uri, &expected));

        assert!(!check_digest(user, realm, "wrong", false, nonce, "DESCRIBE", uri, &expected));
        assert!(!check_digest(user, realm, password, false, "othernonce", "DESCRIBE", uri, &expected));
    }

    #[test]
    fn basic_roundtrip() {
        let encoded = BASE64.encode("alice:secret");
        assert_eq!(basic_credentials(&encoded), Some(("alice".into(), "secret".into())));
        assert!(basic_credentials("!!!notbase64!!!").is_none());
        let no_colon = BASE64.encode("alicesecret");
        assert!(basic_credentials(&no_colon).is_none());
    }
}
