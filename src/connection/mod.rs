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

mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitState};

use crate::config::ConnectionConfig;
use crate::registry::{RegistryError, TenantRegistry};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("circuit open for tenant")]
    CircuitOpen,
    #[error("tenant profile could not be resolved: {0}")]
    Registry(#[from] RegistryError),
    #[error("pool creation failed: {0}")]
    PoolCreation(String),
    #[error("no pool and no fallback store configured")]
    NoFallback,
}

struct PoolEntry {
    pool: PgPool,
    created_at: Instant,
    last_used: Instant,
    healthy: bool,
    last_health_check: Instant,
}

/// One healthy pool per tenant, LRU-evicted, guarded by a per-tenant
/// circuit breaker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    async fn acquire(&self, tenant_id: &str) -> Result<PgPool, ConnectionError>;
    fn stats(&self) -> PoolStats;
    async fn close(&self);
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub pool_count: usize,
    pub healthy_count: usize,
    pub circuit_open_count: usize,
}

pub struct PgConnectionManager {
    pools: RwLock<HashMap<String, PoolEntry>>,
    circuit_breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    acquisition_lock: AsyncMutex<()>,
    registry: Arc<dyn TenantRegistry>,
    config: ConnectionConfig,
    fallback_pool: Option<PgPool>,
    cancel: tokio_util::sync::CancellationToken,
}

impl PgConnectionManager {
    pub async fn new(
        registry: Arc<dyn TenantRegistry>,
        config: ConnectionConfig,
    ) -> anyhow::Result<Self> {
        let fallback_pool = match config.fallback_database_url() {
            Some(url) => Some(
                PgPoolOptions::new()
                    .max_connections(5)
                    .acquire_timeout(config.connection_timeout())
                    .connect(url)
                    .await?,
            ),
            None => None,
        };
        Ok(Self {
            pools: RwLock::new(HashMap::new()),
            circuit_breakers: RwLock::new(HashMap::new()),
            acquisition_lock: AsyncMutex::new(()),
            registry,
            config,
            fallback_pool,
            cancel: tokio_util::sync::CancellationToken::new(),
        })
    }

    fn breaker_for(&self, tenant_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.circuit_breakers.read().unwrap().get(tenant_id) {
            return existing.clone();
        }
        let mut write_guard = self.circuit_breakers.write().unwrap();
        write_guard
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.config.circuit_failure_threshold(),
                    self.config.circuit_failure_ratio(),
                    self.config.circuit_sample_window(),
                    self.config.circuit_sample_min_calls(),
                    self.config.circuit_open_duration(),
                    self.config.circuit_half_open_trial_calls(),
                ))
            })
            .clone()
    }

    fn cached_healthy(&self, tenant_id: &str) -> Option<PgPool> {
        let mut write_guard = self.pools.write().unwrap();
        match write_guard.get_mut(tenant_id) {
            Some(entry) if entry.healthy => {
                entry.last_used = Instant::now();
                Some(entry.pool.clone())
            }
            _ => None,
        }
    }

    async fn build_pool(&self, profile: &crate::registry::TenantProfile) -> Result<PgPool, ConnectionError> {
        let pool = PgPoolOptions::new()
            .max_connections(profile.max_open.max(1))
            .acquire_timeout(self.config.connection_timeout())
            .connect(&profile.dsn())
            .await
            .map_err(|e| ConnectionError::PoolCreation(e.to_string()))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| ConnectionError::PoolCreation(e.to_string()))?;

        if let Err(e) = migrate_tenant_store(&pool).await {
            warn!("audit table migration failed (table may pre-exist): {e}");
        }

        Ok(pool)
    }

    fn evict_lru_if_at_capacity(&self, pools: &mut HashMap<String, PoolEntry>) {
        if pools.len() < self.config.max_pools_per_service() {
            return;
        }
        if let Some(oldest) = pools
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(k, _)| k.clone())
        {
            pools.remove(&oldest);
        }
    }
}

#[async_trait]
impl ConnectionManager for PgConnectionManager {
    async fn acquire(&self, tenant_id: &str) -> Result<PgPool, ConnectionError> {
        let breaker = self.breaker_for(tenant_id);
        if !breaker.allow_call() {
            if let Some(fallback) = &self.fallback_pool {
                return Ok(fallback.clone());
            }
            return Err(ConnectionError::CircuitOpen);
        }

        if let Some(pool) = self.cached_healthy(tenant_id) {
            return Ok(pool);
        }

        let _guard = self.acquisition_lock.lock().await;

        if let Some(pool) = self.cached_healthy(tenant_id) {
            return Ok(pool);
        }

        let profile = match self.registry.resolve(tenant_id).await {
            Ok(profile) => profile,
            Err(e) => {
                breaker.record_failure();
                return self.fallback_pool.clone().ok_or(ConnectionError::Registry(e));
            }
        };

        if !profile.active || !profile.audit_enabled {
            if let Some(fallback) = &self.fallback_pool {
                return Ok(fallback.clone());
            }
            return Err(ConnectionError::Registry(RegistryError::AuditDisabled));
        }

        match self.build_pool(&profile).await {
            Ok(pool) => {
                breaker.record_success();
                let now = Instant::now();
                let mut write_guard = self.pools.write().unwrap();
                self.evict_lru_if_at_capacity(&mut write_guard);
                write_guard.insert(
                    tenant_id.to_string(),
                    PoolEntry {
                        pool: pool.clone(),
                        created_at: now,
                        last_used: now,
                        healthy: true,
                        last_health_check: now,
                    },
                );
                Ok(pool)
            }
            Err(e) => {
                breaker.record_failure();
                match &self.fallback_pool {
                    Some(fallback) => Ok(fallback.clone()),
                    None => Err(e),
                }
            }
        }
    }

    fn stats(&self) -> PoolStats {
        let pools = self.pools.read().unwrap();
        let healthy_count = pools.values().filter(|e| e.healthy).count();
        let circuit_open_count = self
            .circuit_breakers
            .read()
            .unwrap()
            .values()
            .filter(|b| b.state() == CircuitState::Open)
            .count();
        PoolStats {
            pool_count: pools.len(),
            healthy_count,
            circuit_open_count,
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        let mut pools = self.pools.write().unwrap();
        for (_, entry) in pools.drain() {
            entry.pool.close().await;
        }
    }
}

/// Idempotent schema setup: creates the tenant-scoped `audit_logs` and
/// `audit_retention_settings` tables with the indices an audit log read path needs if
/// they don't already exist.
async fn migrate_tenant_store(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_logs (
            id UUID PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            user_id TEXT,
            username TEXT,
            user_email TEXT,
            action TEXT NOT NULL,
            resource TEXT NOT NULL,
            resource_id TEXT,
            resource_name TEXT,
            outcome TEXT NOT NULL,
            severity TEXT NOT NULL,
            method TEXT,
            path TEXT,
            query_string TEXT,
            client_address TEXT,
            user_agent TEXT,
            correlation_id TEXT,
            old_value JSONB,
            new_value JSONB,
            diff JSONB,
            description TEXT,
            metadata JSONB,
            tags TEXT[],
            error_message TEXT,
            error_code TEXT,
            service_name TEXT,
            service_version TEXT,
            occurred_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    for (name, expr) in [
        ("idx_audit_logs_tenant_id", "tenant_id"),
        ("idx_audit_logs_user_id", "user_id"),
        ("idx_audit_logs_action", "action"),
        ("idx_audit_logs_resource", "resource"),
        ("idx_audit_logs_resource_id", "resource_id"),
        ("idx_audit_logs_outcome", "outcome"),
        ("idx_audit_logs_severity", "severity"),
        ("idx_audit_logs_client_address", "client_address"),
        ("idx_audit_logs_correlation_id", "correlation_id"),
        ("idx_audit_logs_service_name", "service_name"),
        ("idx_audit_logs_occurred_at", "occurred_at"),
    ] {
        sqlx::query(&format!("CREATE INDEX IF NOT EXISTS {name} ON audit_logs ({expr})"))
            .execute(pool)
            .await?;
    }
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audit_logs_tenant_occurred ON audit_logs (tenant_id, occurred_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_logs_description_trgm ON audit_logs (description)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_logs_resource_name_trgm ON audit_logs (resource_name)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_retention_settings (
            tenant_id TEXT PRIMARY KEY,
            retention_days INTEGER NOT NULL,
            last_cleanup_at TIMESTAMPTZ,
            logs_deleted_last_run BIGINT NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Closes pools idle longer than the idle threshold (cleanup
/// task).
pub async fn cleanup_loop(
    manager: Arc<PgConnectionManager>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(manager.config.cleanup_interval());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let idle_threshold = manager.config.idle_threshold();
                let mut pools = manager.pools.write().unwrap();
                let stale: Vec<String> = pools
                    .iter()
                    .filter(|(_, e)| e.last_used.elapsed() > idle_threshold)
                    .map(|(k, _)| k.clone())
                    .collect();
                for tenant_id in stale {
                    if let Some(entry) = pools.remove(&tenant_id) {
                        info!(tenant_id, "evicting idle pool");
                        tokio::spawn(async move { entry.pool.close().await });
                    }
                }
            }
        }
    }
}

/// Pings every pool, marking it unhealthy on failure so the next
/// acquisition recreates it (health-check task).
pub async fn health_check_loop(
    manager: Arc<PgConnectionManager>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(manager.config.health_check_interval());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let targets: Vec<(String, PgPool)> = manager
                    .pools
                    .read()
                    .unwrap()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.pool.clone()))
                    .collect();

                for (tenant_id, pool) in targets {
                    let healthy = tokio::time::timeout(Duration::from_secs(5), sqlx::query("SELECT 1").execute(&pool))
                        .await
                        .is_ok_and(|r| r.is_ok());
                    let mut pools = manager.pools.write().unwrap();
                    if let Some(entry) = pools.get_mut(&tenant_id) {
                        entry.healthy = healthy;
                        entry.last_health_check = Instant::now();
                        if !healthy {
                            warn!(tenant_id, "pool failed health check");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_stats_default_to_zero() {
        let stats = PoolStats::default();
        assert_eq!(stats.pool_count, 0);
        assert_eq!(stats.healthy_count, 0);
    }
}
