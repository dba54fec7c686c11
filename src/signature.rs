//! Request signing.
//!
//! Subscribers that registered a shared secret receive an
//! `X-Webpa-Signature: sha1=<hex>` header carrying the HMAC-SHA1 of the
//! exact bytes being sent, for both deliveries and cut-off notifications.

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "X-Webpa-Signature";

/// Compute the signature header value for a request body.
#[must_use]
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_known_vector() {
        // Well-known HMAC-SHA1 example value.
        assert_eq!(
            sign("key", b"The quick brown fox jumps over the lazy dog"),
            "sha1=de7c9b85b8b78aa6bc8a7a36f70a90701c9db4d9"
        );
    }

    #[test]
    fn recomputation_over_received_body_matches() {
        let body = br#"{"status":"online"}"#;
        let header = sign("hunter2", body);
        assert_eq!(header, sign("hunter2", body));
        assert_ne!(header, sign("hunter2", b"tampered"));
        assert_ne!(header, sign("other-secret", body));
    }
}
