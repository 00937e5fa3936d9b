//! HMAC request signing shared by the manager and worker binaries.
//!
//! Every manager<->worker request body is signed with a shared secret:
//! the digest is computed over the raw (already-encoded) request body
//! and sent as a header alongside it.

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header carrying the hex-encoded HMAC digest of the request body.
pub const DIGEST_HEADER: &str = "ClusterRunner-Message-Digest";

/// Header carrying a worker's session id, used to detect silent restarts.
pub const SESSION_ID_HEADER: &str = "ClusterRunner-Session-Id";

type HmacSha256 = Hmac<Sha256>;

/// Computes the hex-encoded HMAC-SHA256 digest of `body` under `secret`.
pub fn digest(body: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies that `candidate_digest` matches the HMAC-SHA256 digest of
/// `body` under `secret`, in constant time.
pub fn verify(body: &[u8], secret: &str, candidate_digest: &str) -> bool {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    let Ok(candidate_bytes) = hex::decode(candidate_digest) else {
        return false;
    };
    mac.verify_slice(&candidate_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_round_trips_through_verify() {
        let body = b"{\"build_id\":1}";
        let secret = "shared-secret";
        let computed = digest(body, secret);
        assert!(verify(body, secret, &computed));
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let secret = "shared-secret";
        let computed = digest(b"{\"build_id\":1}", secret);
        assert!(!verify(b"{\"build_id\":2}", secret, &computed));
    }

    #[test]
    fn verify_rejects_malformed_digest() {
        assert!(!verify(b"body", "secret", "not-hex!"));
    }
}
