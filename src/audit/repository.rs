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

use crate::audit::model::{
    AuditFilter, AuditRecord, AuditSummary, IpHistoryEntry, NewAuditRecord, RetentionSetting,
    UserActivityCount, clamp_retention_days,
};
use crate::cache::{AuditCache, ListPage, digest_filter_key};
use crate::common::error::{RepositoryError, RepositoryResult};
use crate::common::types::{Action, Outcome, Resource, Severity};
use crate::connection::ConnectionManager;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
#[cfg(test)]
use mockall::automock;
use sqlx::{PgPool, QueryBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

const MAX_EXPORT: i64 = 10_000;
const CLEANUP_BATCH: i64 = 1000;

/// Pure data-access seam. Every operation acquires a
/// tenant-scoped pool through the connection manager and filters every
/// query by `tenant_id` even though the pool is already tenant-scoped,
/// as defense in depth.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn create(&self, tenant: &str, record: NewAuditRecord) -> RepositoryResult<AuditRecord>;
    async fn get_by_id(&self, tenant: &str, id: Uuid) -> RepositoryResult<AuditRecord>;
    async fn list(
        &self,
        tenant: &str,
        filter: &AuditFilter,
        order_by: &str,
        order_dir: &str,
        limit: i64,
        offset: i64,
    ) -> RepositoryResult<(Vec<AuditRecord>, i64)>;
    async fn get_resource_history(
        &self,
        tenant: &str,
        resource: &str,
        resource_id: &str,
    ) -> RepositoryResult<Vec<AuditRecord>>;
    async fn get_user_activity(
        &self,
        tenant: &str,
        user_id: &str,
        limit: i64,
    ) -> RepositoryResult<Vec<AuditRecord>>;
    async fn get_critical_events(
        &self,
        tenant: &str,
        hours: i64,
    ) -> RepositoryResult<Vec<AuditRecord>>;
    async fn get_failed_auth(&self, tenant: &str, hours: i64) -> RepositoryResult<Vec<AuditRecord>>;
    async fn get_suspicious(&self, tenant: &str) -> RepositoryResult<Vec<AuditRecord>>;
    async fn ip_history(&self, tenant: &str, user_id: &str) -> RepositoryResult<Vec<IpHistoryEntry>>;
    async fn export(&self, tenant: &str, filter: &AuditFilter) -> RepositoryResult<Vec<AuditRecord>>;
    async fn recent_logs(&self, tenant: &str, limit: i64) -> RepositoryResult<Vec<AuditRecord>>;
    async fn summary(
        &self,
        tenant: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RepositoryResult<AuditSummary>;
    async fn cleanup(&self, tenant: &str, days: i32) -> RepositoryResult<i64>;
    async fn get_retention(&self, tenant: &str) -> RepositoryResult<RetentionSetting>;
    async fn set_retention(&self, tenant: &str, days: i32) -> RepositoryResult<RetentionSetting>;
}

/// Postgres-backed implementation wired atop the connection manager and
/// the audit cache, a thin struct implementing a repository trait over
/// a pool source.
pub struct PgAuditRepository {
    connections: Arc<dyn ConnectionManager>,
    cache: Arc<AuditCache>,
}

impl PgAuditRepository {
    pub fn new(connections: Arc<dyn ConnectionManager>, cache: Arc<AuditCache>) -> Self {
        Self { connections, cache }
    }

    async fn pool(&self, tenant: &str) -> RepositoryResult<PgPool> {
        self.connections
            .acquire(tenant)
            .await
            .map_err(|e| RepositoryError::Custom(e.to_string()))
    }

    fn push_filter<'a>(builder: &mut QueryBuilder<'a, sqlx::Postgres>, filter: &'a AuditFilter) {
        if let Some(action) = &filter.action {
            builder.push(" AND action = ").push_bind(action.to_string());
        }
        if let Some(resource) = &filter.resource {
            builder
                .push(" AND resource = ")
                .push_bind(resource.to_string());
        }
        if let Some(resource_id) = &filter.resource_id {
            builder.push(" AND resource_id = ").push_bind(resource_id);
        }
        if let Some(outcome) = &filter.outcome {
            builder
                .push(" AND outcome = ")
                .push_bind(outcome.to_string());
        }
        if let Some(severity) = &filter.severity {
            builder
                .push(" AND severity = ")
                .push_bind(severity.to_string());
        }
        if let Some(user_id) = &filter.user_id {
            builder.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(client_address) = &filter.client_address {
            builder
                .push(" AND client_address = ")
                .push_bind(client_address);
        }
        if let Some(service_name) = &filter.service_name {
            builder
                .push(" AND service_name = ")
                .push_bind(service_name);
        }
        if let Some(search) = &filter.search {
            let pattern = format!("%{search}%");
            builder.push(" AND (description ILIKE ").push_bind(pattern.clone());
            builder.push(" OR resource_name ILIKE ").push_bind(pattern.clone());
            builder.push(" OR username ILIKE ").push_bind(pattern.clone());
            builder.push(" OR user_email ILIKE ").push_bind(pattern);
            builder.push(")");
        }
        if let Some(from) = filter.from_date {
            builder.push(" AND occurred_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to_date {
            builder.push(" AND occurred_at <= ").push_bind(to);
        }
    }
}

#[async_trait]
impl AuditRepository for PgAuditRepository {
    async fn create(&self, tenant: &str, record: NewAuditRecord) -> RepositoryResult<AuditRecord> {
        let pool = self.pool(tenant).await?;
        let occurred_at = record.occurred_at.unwrap_or_else(Utc::now);
        let action = record.action.unwrap_or(Action::Other);
        let resource = record.resource.unwrap_or(Resource::Other);
        let outcome = record.outcome.unwrap_or(Outcome::Success);
        let severity = record.severity.unwrap_or_default();

        let stored: AuditRecord = sqlx::query_as(
            r#"
            INSERT INTO audit_logs (
                id, tenant_id, user_id, username, user_email,
                action, resource, resource_id, resource_name,
                outcome, severity,
                method, path, query_string, client_address, user_agent, correlation_id,
                old_value, new_value, diff,
                description, metadata, tags,
                error_message, error_code,
                service_name, service_version,
                occurred_at, created_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9,
                $10, $11,
                $12, $13, $14, $15, $16, $17,
                $18, $19, $20,
                $21, $22, $23,
                $24, $25,
                $26, $27,
                $28, now()
            )
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant)
        .bind(&record.user_id)
        .bind(&record.username)
        .bind(&record.user_email)
        .bind(action.to_string())
        .bind(resource.to_string())
        .bind(&record.resource_id)
        .bind(&record.resource_name)
        .bind(outcome.to_string())
        .bind(severity.to_string())
        .bind(&record.method)
        .bind(&record.path)
        .bind(&record.query_string)
        .bind(&record.client_address)
        .bind(&record.user_agent)
        .bind(&record.correlation_id)
        .bind(&record.old_value)
        .bind(&record.new_value)
        .bind(&record.diff)
        .bind(&record.description)
        .bind(&record.metadata)
        .bind(&record.tags)
        .bind(&record.error_message)
        .bind(&record.error_code)
        .bind(&record.service_name)
        .bind(&record.service_version)
        .bind(occurred_at)
        .fetch_one(&pool)
        .await?;

        self.cache.invalidate_after_write(tenant).await?;
        self.cache.push_recent(tenant, stored.clone())?;
        self.cache.set_record(tenant, &stored)?;

        Ok(stored)
    }

    async fn get_by_id(&self, tenant: &str, id: Uuid) -> RepositoryResult<AuditRecord> {
        if let Some(cached) = self.cache.get_record(tenant, id)? {
            return Ok(cached);
        }
        let pool = self.pool(tenant).await?;
        let record: AuditRecord = sqlx::query_as(
            "SELECT * FROM audit_logs WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant)
        .bind(id)
        .fetch_optional(&pool)
        .await?
        .ok_or(RepositoryError::NotFound)?;
        self.cache.set_record(tenant, &record)?;
        Ok(record)
    }

    async fn list(
        &self,
        tenant: &str,
        filter: &AuditFilter,
        order_by: &str,
        order_dir: &str,
        limit: i64,
        offset: i64,
    ) -> RepositoryResult<(Vec<AuditRecord>, i64)> {
        let digest = digest_filter_key(&[
            ("action", filter.action.as_ref().map(|v| v.to_string())),
            ("resource", filter.resource.as_ref().map(|v| v.to_string())),
            ("resource_id", filter.resource_id.clone()),
            ("outcome", filter.outcome.as_ref().map(|v| v.to_string())),
            ("severity", filter.severity.as_ref().map(|v| v.to_string())),
            ("user_id", filter.user_id.clone()),
            ("client_address", filter.client_address.clone()),
            ("service_name", filter.service_name.clone()),
            ("search", filter.search.clone()),
            ("from_date", filter.from_date.map(|v| v.to_rfc3339())),
            ("to_date", filter.to_date.map(|v| v.to_rfc3339())),
            ("order_by", Some(order_by.to_string())),
            ("order_dir", Some(order_dir.to_string())),
            ("limit", Some(limit.to_string())),
            ("offset", Some(offset.to_string())),
        ]);

        if let Some(page) = self.cache.get_list(tenant, &digest).await? {
            return Ok((page.records, page.total));
        }

        let pool = self.pool(tenant).await?;

        let mut count_builder: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM audit_logs WHERE tenant_id = ");
        count_builder.push_bind(tenant);
        Self::push_filter(&mut count_builder, filter);
        let total: (i64,) = count_builder.build_query_as().fetch_one(&pool).await?;

        let mut builder: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT * FROM audit_logs WHERE tenant_id = ");
        builder.push_bind(tenant);
        Self::push_filter(&mut builder, filter);
        builder.push(format!(" ORDER BY {order_by} {order_dir}"));
        builder.push(" LIMIT ").push_bind(limit);
        builder.push(" OFFSET ").push_bind(offset);

        let records: Vec<AuditRecord> = builder.build_query_as().fetch_all(&pool).await?;

        self.cache
            .set_list(
                tenant,
                &digest,
                &ListPage {
                    records: records.clone(),
                    total: total.0,
                },
            )
            .await?;

        Ok((records, total.0))
    }

    async fn get_resource_history(
        &self,
        tenant: &str,
        resource: &str,
        resource_id: &str,
    ) -> RepositoryResult<Vec<AuditRecord>> {
        let pool = self.pool(tenant).await?;
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM audit_logs
            WHERE tenant_id = $1 AND resource = $2 AND resource_id = $3
            ORDER BY occurred_at DESC
            LIMIT 100
            "#,
        )
        .bind(tenant)
        .bind(resource)
        .bind(resource_id)
        .fetch_all(&pool)
        .await?)
    }

    async fn get_user_activity(
        &self,
        tenant: &str,
        user_id: &str,
        limit: i64,
    ) -> RepositoryResult<Vec<AuditRecord>> {
        let pool = self.pool(tenant).await?;
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM audit_logs
            WHERE tenant_id = $1 AND user_id = $2
            ORDER BY occurred_at DESC
            LIMIT $3
            "#,
        )
        .bind(tenant)
        .bind(user_id)
        .bind(limit.min(50).max(1))
        .fetch_all(&pool)
        .await?)
    }

    async fn get_critical_events(
        &self,
        tenant: &str,
        hours: i64,
    ) -> RepositoryResult<Vec<AuditRecord>> {
        if let Some(cached) = self.cache.get_critical(tenant, hours).await? {
            return Ok(cached);
        }

        let pool = self.pool(tenant).await?;
        let since = Utc::now() - ChronoDuration::hours(hours);
        let records: Vec<AuditRecord> = sqlx::query_as(
            r#"
            SELECT * FROM audit_logs
            WHERE tenant_id = $1
                AND severity IN ('HIGH', 'CRITICAL')
                AND occurred_at >= $2
            ORDER BY occurred_at DESC
            LIMIT 100
            "#,
        )
        .bind(tenant)
        .bind(since)
        .fetch_all(&pool)
        .await?;

        self.cache.set_critical(tenant, hours, &records).await?;
        Ok(records)
    }

    async fn get_failed_auth(&self, tenant: &str, hours: i64) -> RepositoryResult<Vec<AuditRecord>> {
        let pool = self.pool(tenant).await?;
        let since = Utc::now() - ChronoDuration::hours(hours);
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM audit_logs
            WHERE tenant_id = $1
                AND action IN ('LOGIN', 'LOGOUT', 'LOGIN_FAILED')
                AND outcome = 'FAILURE'
                AND occurred_at >= $2
            ORDER BY occurred_at DESC
            "#,
        )
        .bind(tenant)
        .bind(since)
        .fetch_all(&pool)
        .await?)
    }

    async fn get_suspicious(&self, tenant: &str) -> RepositoryResult<Vec<AuditRecord>> {
        let pool = self.pool(tenant).await?;
        let since = Utc::now() - ChronoDuration::hours(24);
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM audit_logs
            WHERE tenant_id = $1 AND occurred_at >= $2
                AND (
                    (action IN ('DELETE', 'BULK_DELETE') AND severity IN ('HIGH', 'CRITICAL'))
                    OR (outcome = 'FAILURE' AND severity IN ('HIGH', 'CRITICAL'))
                    OR (action = 'EXPORT' AND resource IN ('CUSTOMER', 'ORDER', 'PAYMENT'))
                )
            ORDER BY occurred_at DESC
            "#,
        )
        .bind(tenant)
        .bind(since)
        .fetch_all(&pool)
        .await?)
    }

    async fn ip_history(&self, tenant: &str, user_id: &str) -> RepositoryResult<Vec<IpHistoryEntry>> {
        let pool = self.pool(tenant).await?;
        Ok(sqlx::query_as(
            r#"
            SELECT
                client_address AS address,
                COUNT(*) AS count,
                MIN(occurred_at) AS first_seen,
                MAX(occurred_at) AS last_seen
            FROM audit_logs
            WHERE tenant_id = $1 AND user_id = $2 AND client_address IS NOT NULL
            GROUP BY client_address
            ORDER BY MAX(occurred_at) DESC
            "#,
        )
        .bind(tenant)
        .bind(user_id)
        .fetch_all(&pool)
        .await?)
    }

    async fn export(&self, tenant: &str, filter: &AuditFilter) -> RepositoryResult<Vec<AuditRecord>> {
        let pool = self.pool(tenant).await?;
        let mut builder: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT * FROM audit_logs WHERE tenant_id = ");
        builder.push_bind(tenant);
        Self::push_filter(&mut builder, filter);
        builder.push(" ORDER BY occurred_at DESC LIMIT ");
        builder.push_bind(MAX_EXPORT);
        Ok(builder.build_query_as().fetch_all(&pool).await?)
    }

    async fn recent_logs(&self, tenant: &str, limit: i64) -> RepositoryResult<Vec<AuditRecord>> {
        if let Some(cached) = self.cache.get_recent(tenant, limit as usize)? {
            return Ok(cached);
        }
        let pool = self.pool(tenant).await?;
        Ok(sqlx::query_as(
            "SELECT * FROM audit_logs WHERE tenant_id = $1 ORDER BY occurred_at DESC LIMIT $2",
        )
        .bind(tenant)
        .bind(limit)
        .fetch_all(&pool)
        .await?)
    }

    async fn summary(
        &self,
        tenant: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RepositoryResult<AuditSummary> {
        if let Some(cached) = self.cache.get_summary(tenant, from, to).await? {
            return Ok(cached);
        }

        let pool = self.pool(tenant).await?;

        let total: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM audit_logs WHERE tenant_id = $1 AND occurred_at BETWEEN $2 AND $3",
        )
        .bind(tenant)
        .bind(from)
        .bind(to)
        .fetch_one(&pool)
        .await?;

        let by_action = Self::histogram(&pool, tenant, from, to, "action").await?;
        let by_resource = Self::histogram(&pool, tenant, from, to, "resource").await?;
        let by_outcome = Self::histogram(&pool, tenant, from, to, "outcome").await?;
        let by_severity = Self::histogram(&pool, tenant, from, to, "severity").await?;

        let top_users: Vec<UserActivityCount> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS count, MAX(occurred_at) AS last_activity
            FROM audit_logs
            WHERE tenant_id = $1 AND occurred_at BETWEEN $2 AND $3 AND user_id IS NOT NULL
            GROUP BY user_id
            ORDER BY count DESC
            LIMIT 10
            "#,
        )
        .bind(tenant)
        .bind(from)
        .bind(to)
        .fetch_all(&pool)
        .await?;

        let recent_failures: Vec<AuditRecord> = sqlx::query_as(
            r#"
            SELECT * FROM audit_logs
            WHERE tenant_id = $1 AND occurred_at BETWEEN $2 AND $3 AND outcome = 'FAILURE'
            ORDER BY occurred_at DESC
            LIMIT 20
            "#,
        )
        .bind(tenant)
        .bind(from)
        .bind(to)
        .fetch_all(&pool)
        .await?;

        let summary = AuditSummary {
            total_logs: total.0,
            by_action,
            by_resource,
            by_outcome,
            by_severity,
            top_users,
            recent_failures,
        };

        self.cache.set_summary(tenant, from, to, &summary).await?;
        Ok(summary)
    }

    async fn cleanup(&self, tenant: &str, days: i32) -> RepositoryResult<i64> {
        let pool = self.pool(tenant).await?;
        let cutoff = Utc::now() - ChronoDuration::days(days as i64);
        let mut total_deleted: i64 = 0;
        loop {
            let deleted: (Vec<Uuid>,) = {
                let rows = sqlx::query_as::<_, (Uuid,)>(
                    r#"
                    DELETE FROM audit_logs
                    WHERE id IN (
                        SELECT id FROM audit_logs
                        WHERE tenant_id = $1 AND occurred_at < $2
                        LIMIT $3
                    )
                    RETURNING id
                    "#,
                )
                .bind(tenant)
                .bind(cutoff)
                .bind(CLEANUP_BATCH)
                .fetch_all(&pool)
                .await?;
                (rows.into_iter().map(|(id,)| id).collect(),)
            };
            let batch_len = deleted.0.len() as i64;
            total_deleted += batch_len;
            if batch_len < CLEANUP_BATCH {
                break;
            }
        }
        self.cache.invalidate_all(tenant)?;
        Ok(total_deleted)
    }

    async fn get_retention(&self, tenant: &str) -> RepositoryResult<RetentionSetting> {
        let pool = self.pool(tenant).await?;
        let existing: Option<RetentionSetting> = sqlx::query_as(
            "SELECT * FROM audit_retention_settings WHERE tenant_id = $1",
        )
        .bind(tenant)
        .fetch_optional(&pool)
        .await?;

        match existing {
            Some(setting) => Ok(setting),
            None => Ok(RetentionSetting {
                tenant_id: tenant.to_string(),
                retention_days: crate::audit::model::DEFAULT_RETENTION_DAYS,
                last_cleanup_at: None,
                logs_deleted_last_run: 0,
            }),
        }
    }

    async fn set_retention(&self, tenant: &str, days: i32) -> RepositoryResult<RetentionSetting> {
        let pool = self.pool(tenant).await?;
        let clamped = clamp_retention_days(days);
        Ok(sqlx::query_as(
            r#"
            INSERT INTO audit_retention_settings (tenant_id, retention_days, logs_deleted_last_run)
            VALUES ($1, $2, 0)
            ON CONFLICT (tenant_id)
            DO UPDATE SET retention_days = EXCLUDED.retention_days
            RETURNING *
            "#,
        )
        .bind(tenant)
        .bind(clamped)
        .fetch_one(&pool)
        .await?)
    }
}

impl PgAuditRepository {
    async fn histogram(
        pool: &PgPool,
        tenant: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        column: &str,
    ) -> RepositoryResult<HashMap<String, i64>> {
        let query = format!(
            r#"
            SELECT {column} AS bucket, COUNT(*) AS count
            FROM audit_logs
            WHERE tenant_id = $1 AND occurred_at BETWEEN $2 AND $3
            GROUP BY {column}
            "#
        );
        let rows: Vec<(String, i64)> = sqlx::query_as(&query)
            .bind(tenant)
            .bind(from)
            .bind(to)
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_applied_on_set_retention_bounds() {
        assert_eq!(clamp_retention_days(1), crate::audit::model::MIN_RETENTION_DAYS);
        assert_eq!(clamp_retention_days(10_000), crate::audit::model::MAX_RETENTION_DAYS);
    }
}
