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

use serde::Deserialize;

/// Central configuration tree, loaded once at startup via [`AppConfig::from_env`].
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    server: ServerConfig,
    registry: RegistryConfig,
    connection: ConnectionConfig,
    cache: CacheConfig,
    event_bus: EventBusConfig,
    crypto: CryptoConfig,
    retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    host: String,
    port: u16,
}

/// Upstream tenant-registry connection parameters plus retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    upstream_url: String,
    local_ttl_secs: u64,
    shared_ttl_secs: u64,
    max_retries: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

/// Connection-manager (C2) sizing and timing knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    max_pools_per_service: usize,
    connection_timeout_secs: u64,
    idle_threshold_secs: u64,
    cleanup_interval_secs: u64,
    health_check_interval_secs: u64,
    circuit_failure_threshold: u32,
    circuit_failure_ratio: f64,
    circuit_sample_window_secs: u64,
    circuit_sample_min_calls: u32,
    circuit_open_duration_secs: u64,
    circuit_half_open_trial_calls: u32,
    /// Shared datastore used when a tenant profile is unavailable.
    fallback_database_url: Option<String>,
}

/// Audit cache sizing and TTLs.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    redis_url: String,
    l1_capacity: usize,
    default_ttl_secs: u64,
    summary_ttl_secs: u64,
    critical_ttl_secs: u64,
    recent_logs_cap: usize,
    recent_logs_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    nats_url: String,
    stream_name: String,
    max_age_hours: i64,
    max_messages: i64,
}

/// AES-256-GCM key used to decrypt tenant datastore passwords at rest.
#[derive(Debug, Clone, Deserialize)]
pub struct CryptoConfig {
    tenant_encryption_key_b64: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    cron_expr: String,
    default_days: i32,
    min_days: i32,
    max_days: i32,
    batch_size: i64,
}

impl AppConfig {
    /// Loads configuration from `config/default` plus environment overrides
    /// prefixed `AUDIT_CORE`, the way `obvia_backend`'s `AppConfig::from_env`
    /// layers its own `config/default` file.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(true))
            .add_source(config::Environment::with_prefix("AUDIT_CORE").separator("__"));
        builder.build()?.try_deserialize()
    }

    pub fn server(&self) -> &ServerConfig {
        &self.server
    }
    pub fn registry(&self) -> &RegistryConfig {
        &self.registry
    }
    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }
    pub fn cache(&self) -> &CacheConfig {
        &self.cache
    }
    pub fn event_bus(&self) -> &EventBusConfig {
        &self.event_bus
    }
    pub fn crypto(&self) -> &CryptoConfig {
        &self.crypto
    }
    pub fn retention(&self) -> &RetentionConfig {
        &self.retention
    }
}

impl ServerConfig {
    pub fn host(&self) -> &str {
        &self.host
    }
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl RegistryConfig {
    pub fn upstream_url(&self) -> &str {
        &self.upstream_url
    }
    pub fn local_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.local_ttl_secs)
    }
    pub fn shared_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shared_ttl_secs)
    }
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
    pub fn base_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.base_delay_ms)
    }
    pub fn max_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.max_delay_ms)
    }
}

impl ConnectionConfig {
    pub fn max_pools_per_service(&self) -> usize {
        self.max_pools_per_service
    }
    pub fn connection_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connection_timeout_secs)
    }
    pub fn idle_threshold(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_threshold_secs)
    }
    pub fn cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cleanup_interval_secs)
    }
    pub fn health_check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.health_check_interval_secs)
    }
    pub fn circuit_failure_threshold(&self) -> u32 {
        self.circuit_failure_threshold
    }
    pub fn circuit_failure_ratio(&self) -> f64 {
        self.circuit_failure_ratio
    }
    pub fn circuit_sample_window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.circuit_sample_window_secs)
    }
    pub fn circuit_sample_min_calls(&self) -> u32 {
        self.circuit_sample_min_calls
    }
    pub fn circuit_open_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.circuit_open_duration_secs)
    }
    pub fn circuit_half_open_trial_calls(&self) -> u32 {
        self.circuit_half_open_trial_calls
    }
    pub fn fallback_database_url(&self) -> Option<&str> {
        self.fallback_database_url.as_deref()
    }
}

impl CacheConfig {
    pub fn redis_url(&self) -> &str {
        &self.redis_url
    }
    pub fn l1_capacity(&self) -> usize {
        self.l1_capacity
    }
    pub fn default_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.default_ttl_secs)
    }
    pub fn summary_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.summary_ttl_secs)
    }
    pub fn critical_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.critical_ttl_secs)
    }
    pub fn recent_logs_cap(&self) -> usize {
        self.recent_logs_cap
    }
    pub fn recent_logs_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.recent_logs_ttl_secs)
    }
}

impl EventBusConfig {
    pub fn nats_url(&self) -> &str {
        &self.nats_url
    }
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }
    pub fn max_age_hours(&self) -> i64 {
        self.max_age_hours
    }
    pub fn max_messages(&self) -> i64 {
        self.max_messages
    }
}

impl CryptoConfig {
    pub fn tenant_encryption_key_b64(&self) -> &str {
        &self.tenant_encryption_key_b64
    }
}

impl RetentionConfig {
    pub fn cron_expr(&self) -> &str {
        &self.cron_expr
    }
    pub fn default_days(&self) -> i32 {
        self.default_days
    }
    pub fn min_days(&self) -> i32 {
        self.min_days
    }
    pub fn max_days(&self) -> i32 {
        self.max_days
    }
    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }
}

#[cfg(test)]
impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            registry: RegistryConfig {
                upstream_url: "http://localhost:4000".to_string(),
                local_ttl_secs: 300,
                shared_ttl_secs: 600,
                max_retries: 3,
                base_delay_ms: 100,
                max_delay_ms: 2000,
            },
            connection: ConnectionConfig {
                max_pools_per_service: 50,
                connection_timeout_secs: 10,
                idle_threshold_secs: 600,
                cleanup_interval_secs: 300,
                health_check_interval_secs: 30,
                circuit_failure_threshold: 5,
                circuit_failure_ratio: 0.5,
                circuit_sample_window_secs: 30,
                circuit_sample_min_calls: 10,
                circuit_open_duration_secs: 60,
                circuit_half_open_trial_calls: 3,
                fallback_database_url: None,
            },
            cache: CacheConfig {
                redis_url: "redis://127.0.0.1/".to_string(),
                l1_capacity: 1000,
                default_ttl_secs: 300,
                summary_ttl_secs: 60,
                critical_ttl_secs: 30,
                recent_logs_cap: 100,
                recent_logs_ttl_secs: 3600,
            },
            event_bus: EventBusConfig {
                nats_url: "127.0.0.1:4222".to_string(),
                stream_name: "AUDIT_EVENTS".to_string(),
                max_age_hours: 24,
                max_messages: 100_000,
            },
            crypto: CryptoConfig {
                tenant_encryption_key_b64: "MDEyMzQ1Njc4OTAxMjM0NTY3ODkwMTIzNDU2Nzg5MDE=".to_string(),
            },
            retention: RetentionConfig {
                cron_expr: "0 0 2 * * *".to_string(),
                default_days: 180,
                min_days: 90,
                max_days: 365,
                batch_size: 1000,
            },
        }
    }
}
