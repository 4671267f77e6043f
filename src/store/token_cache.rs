use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const TOKEN_CACHE_KEY_ENV: &str = "AIMAIL_TOKEN_CACHE_KEY";
const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAccessToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedAccessToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedToken {
    v: u8,
    sealed: String,
}

/// Gmail access token persisted in `token.json`, sealed with AES-256-GCM.
/// Without a key nothing is written and nothing is read back.
#[derive(Clone)]
pub struct TokenCache {
    path: PathBuf,
    key: Option<[u8; KEY_BYTES]>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("path", &self.path)
            .field("encrypted", &self.key.is_some())
            .finish()
    }
}

impl TokenCache {
    pub fn with_key(path: impl Into<PathBuf>, key: Option<[u8; KEY_BYTES]>) -> Self {
        Self {
            path: path.into(),
            key,
        }
    }

    pub fn from_env(path: impl Into<PathBuf>) -> Result<Self> {
        let raw = std::env::var(TOKEN_CACHE_KEY_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let key = raw
            .map(|value| parse_key_hex(&value))
            .transpose()
            .with_context(|| format!("{TOKEN_CACHE_KEY_ENV} must be 64 hex characters (32 bytes)"))?;

        Ok(Self::with_key(path, key))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<CachedAccessToken> {
        let key = self.key.as_ref()?;
        let raw = std::fs::read_to_string(&self.path).ok()?;

        let token = match open(&raw, key) {
            Ok(token) => token,
            Err(error) => {
                warn!("discarding unreadable gmail token cache: {}", error);
                let _ = self.clear();
                return None;
            }
        };

        if token.is_expired() {
            let _ = self.clear();
            return None;
        }
        Some(token)
    }

    pub fn store(&self, token: &CachedAccessToken) -> Result<()> {
        let Some(key) = self.key.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("create token cache directory")?;
        }
        let sealed = seal(token, key)?;
        std::fs::write(&self.path, sealed).context("write gmail token cache")
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error).context("remove gmail token cache"),
        }
    }
}

fn aead_key(key: &[u8; KEY_BYTES]) -> Result<LessSafeKey> {
    UnboundKey::new(&AES_256_GCM, key)
        .map(LessSafeKey::new)
        .map_err(|_| anyhow!("invalid AES-256-GCM key"))
}

/// `{"v":1,"sealed":base64(nonce || ciphertext || tag)}`
fn seal(token: &CachedAccessToken, key: &[u8; KEY_BYTES]) -> Result<String> {
    let mut nonce = [0u8; NONCE_BYTES];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| anyhow!("no randomness for token cache nonce"))?;

    let mut payload = serde_json::to_vec(token).context("serialize cached token")?;
    aead_key(key)?
        .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut payload)
        .map_err(|_| anyhow!("seal cached token"))?;

    let mut sealed = nonce.to_vec();
    sealed.append(&mut payload);
    let envelope = SealedToken {
        v: ENVELOPE_VERSION,
        sealed: STANDARD.encode(sealed),
    };
    serde_json::to_string(&envelope).context("serialize token envelope")
}

fn open(raw: &str, key: &[u8; KEY_BYTES]) -> Result<CachedAccessToken> {
    let envelope: SealedToken = serde_json::from_str(raw).context("parse token envelope")?;
    if envelope.v != ENVELOPE_VERSION {
        return Err(anyhow!("unsupported token envelope version {}", envelope.v));
    }

    let mut sealed = STANDARD
        .decode(envelope.sealed.as_bytes())
        .context("decode sealed token")?;
    if sealed.len() <= NONCE_BYTES {
        return Err(anyhow!("sealed token too short"));
    }
    let mut ciphertext = sealed.split_off(NONCE_BYTES);
    let nonce = Nonce::try_assume_unique_for_key(&sealed).map_err(|_| anyhow!("bad token nonce"))?;

    let plaintext = aead_key(key)?
        .open_in_place(nonce, Aad::empty(), &mut ciphertext)
        .map_err(|_| anyhow!("token cache was sealed with another key"))?;
    serde_json::from_slice(plaintext).context("parse cached token")
}

/// The 64-hex-char value of `AIMAIL_TOKEN_CACHE_KEY`.
pub fn parse_key_hex(raw: &str) -> Result<[u8; KEY_BYTES]> {
    let raw = raw.trim();
    if raw.len() != KEY_BYTES * 2 || !raw.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return Err(anyhow!("token cache key must be {} hex characters", KEY_BYTES * 2));
    }

    let mut key = [0u8; KEY_BYTES];
    for (index, byte) in key.iter_mut().enumerate() {
        let pair = &raw[index * 2..index * 2 + 2];
        *byte = u8::from_str_radix(pair, 16).with_context(|| format!("invalid hex '{pair}'"))?;
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::{parse_key_hex, CachedAccessToken, TokenCache};

    const TEST_KEY_HEX: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("aimail-token-test-{}.json", Uuid::new_v4()))
    }

    fn token(minutes: i64) -> CachedAccessToken {
        CachedAccessToken {
            access_token: "cached-gmail-token".to_string(),
            expires_at: Utc::now() + Duration::minutes(minutes),
        }
    }

    #[test]
    fn sealed_token_round_trips_without_plaintext_on_disk() {
        let path = temp_path();
        let key = parse_key_hex(TEST_KEY_HEX).expect("parse key");
        let cache = TokenCache::with_key(&path, Some(key));

        cache.store(&token(10)).expect("store token");
        let raw = std::fs::read_to_string(&path).expect("read cache file");
        assert!(!raw.contains("cached-gmail-token"));

        let loaded = cache.load().expect("token loads");
        assert_eq!(loaded.access_token, "cached-gmail-token");

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn nothing_is_persisted_without_key() {
        let path = temp_path();
        let cache = TokenCache::with_key(&path, None);
        cache.store(&token(10)).expect("store without key");
        assert!(!path.exists());
        assert!(cache.load().is_none());
    }

    #[test]
    fn expired_or_foreign_tokens_are_discarded() {
        let path = temp_path();
        let key = parse_key_hex(TEST_KEY_HEX).expect("parse key");
        let cache = TokenCache::with_key(&path, Some(key));
        cache.store(&token(-1)).expect("store expired token");
        assert!(cache.load().is_none());
        assert!(!path.exists());

        cache.store(&token(10)).expect("store token");
        let mut other_key = key;
        other_key[0] ^= 0xff;
        let other = TokenCache::with_key(&path, Some(other_key));
        assert!(other.load().is_none());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn key_must_be_32_bytes() {
        assert!(parse_key_hex("abcd").is_err());
        assert!(parse_key_hex(&"zz".repeat(32)).is_err());
        assert!(parse_key_hex(&"é".repeat(32)).is_err());
        let key = parse_key_hex(&TEST_KEY_HEX.to_uppercase()).expect("uppercase hex");
        assert_eq!(key[1], 0x11);
        assert_eq!(key[31], 0xff);
    }

    #[test]
    fn truncated_envelope_is_discarded() {
        let path = temp_path();
        let key = parse_key_hex(TEST_KEY_HEX).expect("parse key");
        std::fs::write(&path, r#"{"v":1,"sealed":"AAAA"}"#).expect("write envelope");

        let cache = TokenCache::with_key(&path, Some(key));
        assert!(cache.load().is_none());
        assert!(!path.exists());
    }
}
