use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const ENVELOPE_VERSION: &str = "v1";
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption key must decode to 32 bytes")]
    KeyLength,
    #[error("malformed token envelope")]
    Envelope,
    #[error("unsupported envelope version: {0}")]
    Version(String),
    #[error("decryption failed")]
    Decrypt,
}

/// AES-256-GCM façade for OAuth material at rest.
///
/// Envelope format: `v1:<b64 nonce>:<b64 ciphertext+tag>`, fresh random
/// nonce per seal. Plaintext reads happen only through this type.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Accepts a 64-char hex string, base64, or 32 raw bytes.
    pub fn from_encoded(encoded: &str) -> Result<Self, CryptoError> {
        let key = decode_key(encoded).ok_or(CryptoError::KeyLength)?;
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        })
    }

    pub fn seal(&self, plaintext: &[u8]) -> String {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        // Aes256Gcm::encrypt only fails on pathological input lengths.
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .expect("aes-gcm seal");
        format!(
            "{ENVELOPE_VERSION}:{}:{}",
            STANDARD.encode(nonce_bytes),
            STANDARD.encode(ciphertext)
        )
    }

    pub fn open(&self, envelope: &str) -> Result<Vec<u8>, CryptoError> {
        let mut parts = envelope.splitn(3, ':');
        let version = parts.next().ok_or(CryptoError::Envelope)?;
        if version != ENVELOPE_VERSION {
            return Err(CryptoError::Version(version.to_string()));
        }
        let nonce_b64 = parts.next().ok_or(CryptoError::Envelope)?;
        let ciphertext_b64 = parts.next().ok_or(CryptoError::Envelope)?;
        let nonce_bytes = STANDARD
            .decode(nonce_b64)
            .map_err(|_| CryptoError::Envelope)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CryptoError::Envelope);
        }
        let ciphertext = STANDARD
            .decode(ciphertext_b64)
            .map_err(|_| CryptoError::Envelope)?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| CryptoError::Decrypt)
    }
}

fn decode_key(encoded: &str) -> Option<[u8; 32]> {
    let encoded = encoded.trim();
    let bytes = if encoded.len() == 64 && encoded.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex_decode(encoded)?
    } else if let Ok(decoded) = STANDARD.decode(encoded) {
        decoded
    } else {
        encoded.as_bytes().to_vec()
    };
    if bytes.len() != 32 {
        return None;
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Some(key)
}

fn hex_decode(input: &str) -> Option<Vec<u8>> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Some(out)
}

/// Lowercase 64-hex SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0xf) as u32, 16).unwrap_or('0'));
    }
    out
}

/// Constant-time byte comparison for key hashes.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Fresh client secret: prefix + 32 random bytes, URL-safe base64 with
/// `-` folded into `_` to keep secrets in the `[A-Za-z0-9_]` class.
pub fn generate_secret(prefix: &str) -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let encoded = URL_SAFE_NO_PAD.encode(bytes).replace('-', "_");
    format!("{prefix}{encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> TokenCipher {
        TokenCipher::from_encoded(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn seal_open_round_trip() {
        let cipher = test_cipher();
        for size in [0usize, 1, 17, 4096, 64 * 1024] {
            let plaintext: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let envelope = cipher.seal(&plaintext);
            assert!(envelope.starts_with("v1:"));
            assert_eq!(cipher.open(&envelope).unwrap(), plaintext);
        }
    }

    #[test]
    fn nonces_differ_between_seals() {
        let cipher = test_cipher();
        let a = cipher.seal(b"same");
        let b = cipher.seal(b"same");
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_envelope_fails() {
        let cipher = test_cipher();
        let envelope = cipher.seal(b"secret");
        let mut bytes = envelope.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] = if bytes[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();
        assert!(matches!(
            cipher.open(&tampered),
            Err(CryptoError::Decrypt | CryptoError::Envelope)
        ));
    }

    #[test]
    fn rejects_wrong_key_sizes() {
        assert!(TokenCipher::from_encoded("short").is_err());
        assert!(TokenCipher::from_encoded(&"ab".repeat(16)).is_err());
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn generated_secrets_carry_prefix_and_entropy() {
        let a = generate_secret("cr_");
        let b = generate_secret("cr_");
        assert!(a.starts_with("cr_") && b.starts_with("cr_"));
        assert_ne!(a, b);
        assert!(a.len() > 40);
    }

    #[test]
    fn constant_time_eq_matches_exact_bytes() {
        assert!(constant_time_eq(b"aaaa", b"aaaa"));
        assert!(!constant_time_eq(b"aaaa", b"aaab"));
        assert!(!constant_time_eq(b"aaaa", b"aaa"));
    }
}
