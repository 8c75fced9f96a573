use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by the short-lived redirect token handed to clients.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RedirectClaims {
    /// Server URL the client is being steered to.
    pub sub: String,
    /// The requesting client.
    pub aud: String,
    pub path: String,
    pub caps: Vec<String>,
    /// Expiry, epoch seconds.
    pub exp: i64,
}

/// Signing is delegated: the director treats key custody as opaque and only
/// requires something that can mint a compact token from claims.
pub trait RedirectTokenSigner: Send + Sync {
    fn sign(&self, claims: &RedirectClaims) -> anyhow::Result<String>;
}

#[derive(Serialize)]
struct JoseHeader<'a> {
    alg: &'a str,
    typ: &'a str,
    kid: &'a str,
}

/// HS256 compact JWS signer. The wire format is the standard three-part
/// `base64url(header).base64url(claims).base64url(mac)` token.
pub struct HmacTokenSigner {
    key_id: String,
    key: Vec<u8>,
}

impl HmacTokenSigner {
    pub fn new(key_id: impl Into<String>, key: Vec<u8>) -> Self {
        HmacTokenSigner {
            key_id: key_id.into(),
            key,
        }
    }
}

impl RedirectTokenSigner for HmacTokenSigner {
    fn sign(&self, claims: &RedirectClaims) -> anyhow::Result<String> {
        let header = serde_json::to_vec(&JoseHeader {
            alg: "HS256",
            typ: "JWT",
            kid: &self.key_id,
        })?;
        let payload = serde_json::to_vec(claims)?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        );

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| anyhow::anyhow!("invalid signing key: {e}"))?;
        mac.update(signing_input.as_bytes());
        let tag = mac.finalize().into_bytes();

        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(tag)))
    }
}

/// Verifies the signature on an incoming advertisement. The director only
/// checks server-side signatures; end-user auth never happens here.
pub trait AdVerifier: Send + Sync {
    fn verify(&self, key_id: &str, payload: &[u8], signature_b64: &str) -> bool;
}

/// Static keyring verifier: one shared HMAC key per registered key id.
pub struct HmacAdVerifier {
    keys: HashMap<String, Vec<u8>>,
}

impl HmacAdVerifier {
    pub fn new(keys: HashMap<String, Vec<u8>>) -> Self {
        HmacAdVerifier { keys }
    }
}

impl AdVerifier for HmacAdVerifier {
    fn verify(&self, key_id: &str, payload: &[u8], signature_b64: &str) -> bool {
        let Some(key) = self.keys.get(key_id) else {
            return false;
        };
        let Ok(sig) = URL_SAFE_NO_PAD.decode(signature_b64) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
            return false;
        };
        mac.update(payload);
        mac.verify_slice(&sig).is_ok()
    }
}

/// Accept-everything verifier for open federations and tests.
pub struct InsecureAdVerifier;

impl AdVerifier for InsecureAdVerifier {
    fn verify(&self, _key_id: &str, _payload: &[u8], _signature_b64: &str) -> bool {
        true
    }
}

/// Produce the signature an advertiser would send, for tests and tooling.
pub fn sign_payload(key: &[u8], payload: &[u8]) -> anyhow::Result<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("invalid signing key: {e}"))?;
    mac.update(payload);
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_token_has_three_parts_and_round_trips() {
        let signer = HmacTokenSigner::new("kid-1", b"secret".to_vec());
        let claims = RedirectClaims {
            sub: "https://cache-a.example.com".to_string(),
            aud: "198.51.100.7".to_string(),
            path: "/data/file".to_string(),
            caps: vec!["reads".to_string()],
            exp: 1_900_000_000,
        };

        let token = signer.sign(&claims).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let payload = URL_SAFE_NO_PAD.decode(parts[1]).unwrap();
        let decoded: RedirectClaims = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded, claims);

        let header = URL_SAFE_NO_PAD.decode(parts[0]).unwrap();
        let header: serde_json::Value = serde_json::from_slice(&header).unwrap();
        assert_eq!(header["alg"], "HS256");
        assert_eq!(header["kid"], "kid-1");
    }

    #[test]
    fn verifier_accepts_matching_signature_only() {
        let mut keys = HashMap::new();
        keys.insert("origin-key".to_string(), b"shhh".to_vec());
        let verifier = HmacAdVerifier::new(keys);

        let payload = br#"{"name":"o1"}"#;
        let sig = sign_payload(b"shhh", payload).unwrap();

        assert!(verifier.verify("origin-key", payload, &sig));
        assert!(!verifier.verify("origin-key", b"tampered", &sig));
        assert!(!verifier.verify("unknown-key", payload, &sig));
        assert!(!verifier.verify("origin-key", payload, "not-base64!"));
    }
}
