use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::AuthError;
use crate::models::TokenRefreshResult;

/// Source of bearer credentials. The sync worker treats it as a black box.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current access token.
    async fn current(&self) -> Result<String, AuthError>;
    /// Exchange the refresh credential for a new access token.
    /// `AuthError::RefreshRejected` is terminal: the user must log in again.
    async fn refresh(&self) -> Result<String, AuthError>;
}

/// Token provider backed by the remote `/auth/refresh` endpoint.
/// Tokens are set by the login flow and kept in memory only.
pub struct AuthManager {
    api_base_url: String,
    client: reqwest::Client,
    access_token: tokio::sync::RwLock<Option<String>>,
    refresh_token: tokio::sync::RwLock<Option<String>>,
    /// Serializes refreshes so a rotating refresh token is used once.
    refresh_lock: tokio::sync::Mutex<()>,
    reauth_required: AtomicBool,
}

#[derive(serde::Deserialize)]
struct RefreshResponse {
    #[serde(alias = "accessToken")]
    access_token: String,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
}

impl AuthManager {
    pub fn new(api_base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_base_url,
            client,
            access_token: tokio::sync::RwLock::new(None),
            refresh_token: tokio::sync::RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            reauth_required: AtomicBool::new(false),
        }
    }

    /// Set tokens after login (or clear them on logout).
    pub async fn set_tokens(&self, access_token: Option<String>, refresh_token: Option<String>) {
        let has_access = access_token.as_ref().map_or(false, |s| !s.is_empty());
        *self.access_token.write().await = access_token.filter(|s| !s.is_empty());
        *self.refresh_token.write().await = refresh_token.filter(|s| !s.is_empty());
        if has_access {
            self.reauth_required.store(false, Ordering::Release);
        }
        info!("[AUTH] Tokens updated: access token present={}", has_access);
    }

    pub fn reauth_required(&self) -> bool {
        self.reauth_required.load(Ordering::Acquire)
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<TokenRefreshResult, AuthError> {
        let url = format!("{}/auth/refresh", self.api_base_url);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AuthError::RefreshRejected);
        }
        if !status.is_success() {
            return Err(AuthError::Network(format!(
                "Token refresh failed with status: {}",
                status
            )));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        if body.access_token.is_empty() {
            return Err(AuthError::InvalidResponse(
                "Missing access_token in refresh response".into(),
            ));
        }
        Ok(TokenRefreshResult {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
        })
    }
}

#[async_trait]
impl TokenProvider for AuthManager {
    async fn current(&self) -> Result<String, AuthError> {
        self.access_token
            .read()
            .await
            .clone()
            .ok_or(AuthError::NotAuthenticated)
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        let _serial = self.refresh_lock.lock().await;
        let refresh = self
            .refresh_token
            .read()
            .await
            .clone()
            .ok_or(AuthError::NotAuthenticated)?;

        match self.request_refresh(&refresh).await {
            Ok(result) => {
                let access = result.access_token.clone();
                *self.access_token.write().await = Some(result.access_token);
                if let Some(rotated) = result.refresh_token {
                    *self.refresh_token.write().await = Some(rotated);
                }
                info!("[AUTH] Access token refreshed");
                Ok(access)
            }
            Err(AuthError::RefreshRejected) => {
                warn!("[AUTH] Refresh token rejected (401), re-login required");
                self.reauth_required.store(true, Ordering::Release);
                *self.access_token.write().await = None;
                Err(AuthError::RefreshRejected)
            }
            Err(e) => {
                warn!("[AUTH] Token refresh failed: {}", e);
                Err(e)
            }
        }
    }
}

// ============================================
// PAYLOAD ENCRYPTION
// ============================================

const KEY_FILE: &str = "payload.key";

/// AES-256-GCM encryption of outbox payloads at rest.
/// Stored form: base64(nonce || ciphertext).
pub struct PayloadEncryption {
    cipher: Aes256Gcm,
}

impl PayloadEncryption {
    /// Key from `TIMELEDGER_ENCRYPTION_KEY` (hex), else from `payload.key`
    /// in `key_dir` (generated on first use), else an ephemeral key.
    pub fn new(key_dir: Option<&Path>) -> Result<Self, String> {
        let key = match std::env::var("TIMELEDGER_ENCRYPTION_KEY") {
            Ok(hex_key) if !hex_key.is_empty() => hex::decode(hex_key.trim())
                .map_err(|e| format!("Invalid TIMELEDGER_ENCRYPTION_KEY: {}", e))?,
            _ => match key_dir {
                Some(dir) => Self::load_or_create_key(dir)?,
                None => Aes256Gcm::generate_key(OsRng).to_vec(),
            },
        };

        if key.len() != 32 {
            return Err("Encryption key must be 32 bytes".to_string());
        }
        let key = Key::<Aes256Gcm>::from_slice(&key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    fn load_or_create_key(dir: &Path) -> Result<Vec<u8>, String> {
        let path = dir.join(KEY_FILE);
        if path.exists() {
            let hex_key = std::fs::read_to_string(&path)
                .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
            return hex::decode(hex_key.trim())
                .map_err(|e| format!("Corrupted key file {}: {}", path.display(), e));
        }

        let key = Aes256Gcm::generate_key(OsRng).to_vec();
        std::fs::write(&path, hex::encode(&key))
            .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            {
                warn!("[AUTH] Failed to restrict key file permissions: {}", e);
            }
        }
        info!("[AUTH] Generated new payload key at {}", path.display());
        Ok(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| format!("Encryption failed: {}", e))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);

        use base64::{engine::general_purpose, Engine as _};
        Ok(general_purpose::STANDARD.encode(&result))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String, String> {
        use base64::{engine::general_purpose, Engine as _};
        let data = general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|e| format!("Base64 decode failed: {}", e))?;

        if data.len() < 12 {
            return Err("Invalid encrypted data length".to_string());
        }
        let (nonce, ciphertext) = data.split_at(12);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| format!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| format!("UTF-8 decode failed: {}", e))
    }
}
