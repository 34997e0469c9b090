/*
 * This file is part of the Obvia ERP.
 *
 * Copyright (C) 2025 Kovács Dávid <kapcsolat@kovacsdavid.dev>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::common::cache::TtlCache;
use crate::common::error::RepositoryError;
use crate::common::types::tenant_id::TenantId;
use crate::common::types::value_object::{ValueObject, ValueObjectable};
use crate::config::RegistryConfig;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

const NONCE_LEN: usize = 12;

/// The decrypted, validated profile `resolve` returns ("Tenant
/// Profile").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantProfile {
    pub tenant_id: String,
    pub product_id: Option<String>,
    pub vendor_id: Option<String>,

    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub tls_mode: String,
    pub max_open: u32,
    pub max_idle: u32,
    pub max_lifetime_secs: u64,

    pub active: bool,
    pub audit_enabled: bool,
    pub realtime_enabled: bool,
    pub export_enabled: bool,
    pub retention_days: i32,
    pub max_logs_per_day: Option<i64>,
}

impl TenantProfile {
    pub fn dsn(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.database, self.tls_mode
        )
    }
}

/// The encrypted-at-rest wire shape fetched from the upstream registry.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamTenantProfile {
    pub tenant_id: String,
    pub product_id: Option<String>,
    pub vendor_id: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    /// base64(nonce ‖ ciphertext ‖ tag).
    pub encrypted_password: String,
    pub database: String,
    pub tls_mode: String,
    pub max_open: u32,
    pub max_idle: u32,
    pub max_lifetime_secs: u64,
    pub active: bool,
    pub audit_enabled: bool,
    pub realtime_enabled: bool,
    pub export_enabled: bool,
    pub retention_days: i32,
    pub max_logs_per_day: Option<i64>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid tenant id")]
    InvalidTenantId,
    #[error("tenant is inactive")]
    TenantInactive,
    #[error("audit is disabled for this tenant")]
    AuditDisabled,
    #[error("tenant not found")]
    TenantNotFound,
    #[error("tenant registry upstream is unavailable")]
    RegistryUnavailable,
    #[error("stored tenant credentials could not be decrypted")]
    InvalidCredentials,
    #[error("lock error: {0}")]
    Lock(String),
}

/// Decrypts a tenant's stored password. `key` must be exactly 32 bytes
/// (AES-256); a shorter or longer key is a startup-time fatal configuration
/// error.
pub fn decrypt_password(key: &[u8], encrypted: &str) -> Result<String, RegistryError> {
    use base64::Engine;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encrypted)
        .map_err(|_| RegistryError::InvalidCredentials)?;
    if raw.len() <= NONCE_LEN {
        return Err(RegistryError::InvalidCredentials);
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| RegistryError::InvalidCredentials)?;
    String::from_utf8(plaintext).map_err(|_| RegistryError::InvalidCredentials)
}

/// Fetches tenant profiles from the upstream registry service. Implemented
/// separately from [`TenantRegistry`] so tests can substitute a mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UpstreamRegistryClient: Send + Sync {
    async fn fetch(&self, tenant_id: &str) -> Result<UpstreamTenantProfile, RegistryError>;
    async fn list_audit_enabled(&self) -> Result<Vec<String>, RegistryError>;
}

pub struct HttpUpstreamRegistryClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpUpstreamRegistryClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, RegistryError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|_| RegistryError::RegistryUnavailable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::TenantNotFound);
        }
        if !response.status().is_success() {
            return Err(RegistryError::RegistryUnavailable);
        }
        response
            .json::<T>()
            .await
            .map_err(|_| RegistryError::RegistryUnavailable)
    }
}

#[async_trait]
impl UpstreamRegistryClient for HttpUpstreamRegistryClient {
    async fn fetch(&self, tenant_id: &str) -> Result<UpstreamTenantProfile, RegistryError> {
        let url = format!("{}/tenants/{tenant_id}", self.base_url);
        self.get_json(&url).await
    }

    async fn list_audit_enabled(&self) -> Result<Vec<String>, RegistryError> {
        let url = format!("{}/tenants?audit_enabled=true", self.base_url);
        self.get_json(&url).await
    }
}

/// Resolves, caches and periodically refreshes tenant profiles.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TenantRegistry: Send + Sync {
    async fn resolve(&self, tenant_id: &str) -> Result<TenantProfile, RegistryError>;
    async fn invalidate(&self, tenant_id: &str) -> Result<(), RegistryError>;
    async fn list_known(&self) -> Result<Vec<String>, RegistryError>;
    async fn warm(&self, tenant_ids: &[String]);
}

const SHARED_KNOWN_SET: &str = "registry:tenants:known";

/// Tenant profile distributed across every instance of this service via
/// Redis. `None` when the shared tier is unreachable at startup; `resolve`
/// then falls back to the upstream registry on every local-tier miss, same
/// as it would for a miss in the shared tier itself.
pub struct DefaultTenantRegistry {
    upstream: Arc<dyn UpstreamRegistryClient>,
    local: TtlCache<String, TenantProfile>,
    shared: Option<Mutex<MultiplexedConnection>>,
    config: RegistryConfig,
    encryption_key: Vec<u8>,
}

impl DefaultTenantRegistry {
    pub fn new(
        upstream: Arc<dyn UpstreamRegistryClient>,
        config: RegistryConfig,
        encryption_key: Vec<u8>,
        shared: Option<MultiplexedConnection>,
    ) -> anyhow::Result<Self> {
        if encryption_key.len() != 32 {
            anyhow::bail!(
                "tenant encryption key must be exactly 32 bytes, got {}",
                encryption_key.len()
            );
        }
        Ok(Self {
            upstream,
            local: TtlCache::new(10_000),
            shared: shared.map(Mutex::new),
            config,
            encryption_key,
        })
    }

    fn shared_key(tenant_id: &str) -> String {
        format!("registry:tenant:{tenant_id}")
    }

    async fn shared_get(&self, tenant_id: &str) -> Option<TenantProfile> {
        let shared = self.shared.as_ref()?;
        let mut conn = match shared.lock() {
            Ok(guard) => guard.clone(),
            Err(e) => {
                warn!("shared tenant cache lock poisoned: {e}");
                return None;
            }
        };
        let raw: Option<String> = match conn.get(Self::shared_key(tenant_id)).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(tenant_id, "shared tenant cache read failed: {e}");
                return None;
            }
        };
        raw.and_then(|json| serde_json::from_str(&json).ok())
    }

    async fn shared_set(&self, tenant_id: &str, profile: &TenantProfile) {
        let Some(shared) = &self.shared else { return };
        let mut conn = match shared.lock() {
            Ok(guard) => guard.clone(),
            Err(e) => {
                warn!("shared tenant cache lock poisoned: {e}");
                return;
            }
        };
        let Ok(payload) = serde_json::to_string(profile) else {
            return;
        };
        if let Err(e) = conn
            .set_ex::<_, _, ()>(
                Self::shared_key(tenant_id),
                payload,
                self.config.shared_ttl().as_secs(),
            )
            .await
        {
            warn!(tenant_id, "shared tenant cache write failed: {e}");
            return;
        }
        if let Err(e) = conn.sadd::<_, _, ()>(SHARED_KNOWN_SET, tenant_id).await {
            warn!(tenant_id, "shared tenant known-set update failed: {e}");
        }
    }

    async fn shared_remove(&self, tenant_id: &str) {
        let Some(shared) = &self.shared else { return };
        let mut conn = match shared.lock() {
            Ok(guard) => guard.clone(),
            Err(e) => {
                warn!("shared tenant cache lock poisoned: {e}");
                return;
            }
        };
        if let Err(e) = conn
            .del::<_, ()>(Self::shared_key(tenant_id))
            .await
        {
            warn!(tenant_id, "shared tenant cache delete failed: {e}");
        }
        if let Err(e) = conn.srem::<_, _, ()>(SHARED_KNOWN_SET, tenant_id).await {
            warn!(tenant_id, "shared tenant known-set removal failed: {e}");
        }
    }

    async fn shared_known(&self) -> Vec<String> {
        let Some(shared) = &self.shared else {
            return Vec::new();
        };
        let mut conn = match shared.lock() {
            Ok(guard) => guard.clone(),
            Err(e) => {
                warn!("shared tenant cache lock poisoned: {e}");
                return Vec::new();
            }
        };
        conn.smembers(SHARED_KNOWN_SET).await.unwrap_or_else(|e| {
            warn!("shared tenant known-set read failed: {e}");
            Vec::new()
        })
    }

    fn validate_tenant_id(tenant_id: &str) -> Result<(), RegistryError> {
        ValueObject::new(TenantId(tenant_id.to_string()))
            .map(|_| ())
            .map_err(|_| RegistryError::InvalidTenantId)
    }

    async fn fetch_with_retry(&self, tenant_id: &str) -> Result<UpstreamTenantProfile, RegistryError> {
        let mut delay = self.config.base_delay();
        let max_delay = self.config.max_delay();
        let mut attempt = 0u32;
        loop {
            match self.upstream.fetch(tenant_id).await {
                Ok(profile) => return Ok(profile),
                Err(RegistryError::TenantNotFound) => return Err(RegistryError::TenantNotFound),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.max_retries() {
                        warn!(tenant_id, attempts = attempt, "registry fetch exhausted retries: {e}");
                        return Err(RegistryError::RegistryUnavailable);
                    }
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, max_delay);
                }
            }
        }
    }

    fn decrypt(&self, upstream: UpstreamTenantProfile) -> Result<TenantProfile, RegistryError> {
        let password = decrypt_password(&self.encryption_key, &upstream.encrypted_password)?;
        Ok(TenantProfile {
            tenant_id: upstream.tenant_id,
            product_id: upstream.product_id,
            vendor_id: upstream.vendor_id,
            host: upstream.host,
            port: upstream.port,
            user: upstream.user,
            password,
            database: upstream.database,
            tls_mode: upstream.tls_mode,
            max_open: upstream.max_open,
            max_idle: upstream.max_idle,
            max_lifetime_secs: upstream.max_lifetime_secs,
            active: upstream.active,
            audit_enabled: upstream.audit_enabled,
            realtime_enabled: upstream.realtime_enabled,
            export_enabled: upstream.export_enabled,
            retention_days: upstream.retention_days,
            max_logs_per_day: upstream.max_logs_per_day,
        })
    }
}

#[async_trait]
impl TenantRegistry for DefaultTenantRegistry {
    async fn resolve(&self, tenant_id: &str) -> Result<TenantProfile, RegistryError> {
        Self::validate_tenant_id(tenant_id)?;

        if let Some(profile) = self
            .local
            .get(&tenant_id.to_string())
            .map_err(|e| RegistryError::Lock(e.to_string()))?
        {
            if !profile.active {
                self.invalidate(tenant_id).await?;
                return Err(RegistryError::TenantInactive);
            }
            return Ok(profile);
        }

        if let Some(profile) = self.shared_get(tenant_id).await {
            self.local
                .insert(tenant_id.to_string(), profile.clone(), self.config.local_ttl())
                .map_err(|e| RegistryError::Lock(e.to_string()))?;
            return Ok(profile);
        }

        let upstream = self.fetch_with_retry(tenant_id).await?;
        let profile = self.decrypt(upstream)?;

        if !profile.active {
            return Err(RegistryError::TenantInactive);
        }
        if !profile.audit_enabled {
            return Err(RegistryError::AuditDisabled);
        }

        self.local
            .insert(tenant_id.to_string(), profile.clone(), self.config.local_ttl())
            .map_err(|e| RegistryError::Lock(e.to_string()))?;
        self.shared_set(tenant_id, &profile).await;

        Ok(profile)
    }

    async fn invalidate(&self, tenant_id: &str) -> Result<(), RegistryError> {
        self.local
            .invalidate(&tenant_id.to_string())
            .map_err(|e| RegistryError::Lock(e.to_string()))?;
        self.shared_remove(tenant_id).await;
        Ok(())
    }

    async fn list_known(&self) -> Result<Vec<String>, RegistryError> {
        let known = self.shared_known().await;
        if !known.is_empty() {
            return Ok(known);
        }
        self.upstream.list_audit_enabled().await
    }

    async fn warm(&self, tenant_ids: &[String]) {
        for tenant_id in tenant_ids {
            if let Err(e) = self.resolve(tenant_id).await {
                warn!(tenant_id, "failed to warm tenant profile: {e}");
            }
        }
    }
}

/// Background refresh loop; re-resolves every
/// known tenant on each tick so TTL-expired entries repopulate ahead of a
/// request needing them.
pub async fn refresh_loop(
    registry: Arc<dyn TenantRegistry>,
    interval: std::time::Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("tenant registry refresh loop shutting down");
                return;
            }
            _ = ticker.tick() => {
                match registry.list_known().await {
                    Ok(known) => registry.warm(&known).await,
                    Err(e) => warn!("refresh loop failed to list known tenants: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::aead::OsRng;

    fn sample_key() -> Vec<u8> {
        vec![7u8; 32]
    }

    fn encrypt(key: &[u8], plaintext: &str) -> String {
        use aes_gcm::aead::rand_core::RngCore;
        use base64::Engine;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher.encrypt(nonce, plaintext.as_bytes()).unwrap();
        let mut payload = nonce_bytes.to_vec();
        payload.extend(ciphertext);
        base64::engine::general_purpose::STANDARD.encode(payload)
    }

    #[test]
    fn decrypts_round_tripped_password() {
        let key = sample_key();
        let encrypted = encrypt(&key, "hunter2");
        assert_eq!(decrypt_password(&key, &encrypted).unwrap(), "hunter2");
    }

    #[test]
    fn rejects_malformed_ciphertext() {
        let key = sample_key();
        assert!(decrypt_password(&key, "not-base64!!").is_err());
    }

    #[test]
    fn rejects_short_payload() {
        use base64::Engine;
        let key = sample_key();
        let short = base64::engine::general_purpose::STANDARD.encode([1, 2, 3]);
        assert!(decrypt_password(&key, &short).is_err());
    }

    #[test]
    fn registry_construction_rejects_wrong_key_length() {
        let upstream = Arc::new(MockUpstreamRegistryClient::new());
        let config = crate::config::AppConfig::default().registry().clone();
        let result = DefaultTenantRegistry::new(upstream, config, vec![1, 2, 3], None);
        assert!(result.is_err());
    }
}
