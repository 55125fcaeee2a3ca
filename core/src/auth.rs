use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a token string.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable client identity derived from a bearer token: `cid-` + the first
/// 16 hex chars of the token's SHA-256. The raw token never appears in
/// logs, lease ownership records, or task payloads.
pub fn client_fingerprint(token: &str) -> String {
    let digest = hash_token(token);
    format!("cid-{}", &digest[..16])
}
