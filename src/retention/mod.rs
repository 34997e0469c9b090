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

use crate::audit::repository::AuditRepository;
use crate::config::RetentionConfig;
use crate::registry::TenantRegistry;
use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cron-driven sweep that reads every known tenant's retention policy
/// and deletes everything older than it.
pub struct RetentionScheduler {
    registry: Arc<dyn TenantRegistry>,
    repository: Arc<dyn AuditRepository>,
    config: RetentionConfig,
}

#[derive(Debug, Default)]
struct SweepSummary {
    tenants_processed: usize,
    tenants_failed: usize,
    total_deleted: i64,
}

impl RetentionScheduler {
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        repository: Arc<dyn AuditRepository>,
        config: RetentionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            repository,
            config,
        })
    }

    /// Runs the cron expression forever until cancelled; a malformed
    /// expression is a startup-time fatal error, not a silent no-op.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let schedule = Schedule::from_str(self.config.cron_expr())?;
        loop {
            let Some(next_fire) = schedule.upcoming(Utc).next() else {
                warn!("retention cron expression has no further occurrences, stopping");
                return Ok(());
            };
            let wait = (next_fire - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(0));

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("retention scheduler shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {
                    self.sweep().await;
                }
            }
        }
    }

    async fn sweep(&self) {
        let started = std::time::Instant::now();
        let tenants = match self.registry.list_known().await {
            Ok(tenants) => tenants,
            Err(e) => {
                error!("retention sweep aborted, could not list known tenants: {e}");
                return;
            }
        };

        let mut summary = SweepSummary::default();
        for tenant in &tenants {
            match self.sweep_tenant(tenant).await {
                Ok(deleted) => {
                    summary.tenants_processed += 1;
                    summary.total_deleted += deleted;
                }
                Err(e) => {
                    summary.tenants_failed += 1;
                    warn!(tenant, "retention cleanup failed for tenant: {e}");
                }
            }
        }

        info!(
            tenants_processed = summary.tenants_processed,
            tenants_failed = summary.tenants_failed,
            total_deleted = summary.total_deleted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "retention sweep complete"
        );
    }

    async fn sweep_tenant(&self, tenant: &str) -> crate::common::error::RepositoryResult<i64> {
        let days = match self.repository.get_retention(tenant).await {
            Ok(setting) => setting.retention_days,
            Err(_) => self.config.default_days(),
        };
        self.repository.cleanup(tenant, days).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::repository::MockAuditRepository;
    use crate::registry::MockTenantRegistry;

    fn test_config() -> RetentionConfig {
        crate::config::AppConfig::default().retention().clone()
    }

    #[tokio::test]
    async fn sweep_aggregates_across_tenants_and_tolerates_one_failure() {
        let mut registry = MockTenantRegistry::new();
        registry
            .expect_list_known()
            .returning(|| Ok(vec!["t1".to_string(), "t2".to_string()]));

        let mut repo = MockAuditRepository::new();
        repo.expect_get_retention().returning(|tenant| {
            Ok(crate::audit::model::RetentionSetting {
                tenant_id: tenant.to_string(),
                retention_days: 180,
                last_cleanup_at: None,
                logs_deleted_last_run: 0,
            })
        });
        repo.expect_cleanup().returning(|tenant, _days| {
            if tenant == "t1" {
                Ok(42)
            } else {
                Err(crate::common::error::RepositoryError::TenantPoolNotFound)
            }
        });

        let scheduler = RetentionScheduler::new(Arc::new(registry), Arc::new(repo), test_config());
        scheduler.sweep().await;
    }

    #[tokio::test]
    async fn sweep_falls_back_to_default_days_when_retention_read_fails() {
        let mut registry = MockTenantRegistry::new();
        registry.expect_list_known().returning(|| Ok(vec!["t1".to_string()]));

        let mut repo = MockAuditRepository::new();
        repo.expect_get_retention()
            .returning(|_| Err(crate::common::error::RepositoryError::NotFound));
        repo.expect_cleanup()
            .withf(|_, days| *days == 180)
            .returning(|_, _| Ok(5));

        let scheduler = RetentionScheduler::new(Arc::new(registry), Arc::new(repo), test_config());
        scheduler.sweep().await;
    }
}
