use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `payload` keyed with `secret`.
pub fn hmac_sha256_hex(secret: &[u8], payload: &[u8]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a hex HMAC-SHA256 signature using constant-time comparison.
///
/// Comparison is case-insensitive on the hex digits.
pub fn verify_hex_signature(
    secret: &[u8],
    payload: &[u8],
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected = hmac_sha256_hex(secret, payload)?;
    let provided = signature.trim().to_ascii_lowercase();

    if expected.len() != provided.len() {
        return Ok(false);
    }

    Ok(expected.as_bytes().ct_eq(provided.as_bytes()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2
        let sig = hmac_sha256_hex(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn verifies_matching_signature() {
        let sig = hmac_sha256_hex(b"secret", b"payload").unwrap();
        assert!(verify_hex_signature(b"secret", b"payload", &sig).unwrap());
        assert!(verify_hex_signature(b"secret", b"payload", &sig.to_uppercase()).unwrap());
    }

    #[test]
    fn rejects_tampered_payload_or_truncated_signature() {
        let sig = hmac_sha256_hex(b"secret", b"payload").unwrap();
        assert!(!verify_hex_signature(b"secret", b"payload!", &sig).unwrap());
        assert!(!verify_hex_signature(b"secret", b"payload", &sig[..10]).unwrap());
        assert!(!verify_hex_signature(b"other", b"payload", &sig).unwrap());
    }
}
