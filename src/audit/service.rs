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

use crate::audit::model::{AuditFilter, AuditRecord, AuditSummary, NewAuditRecord, RetentionSetting};
use crate::audit::repository::AuditRepository;
use crate::common::error::RepositoryResult;
use crate::common::types::Severity;
use async_trait::async_trait;
use chrono::Utc;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("event fabric publish failed: {0}")]
    Publish(String),
}

/// Outbound event fabric seam. Publish
/// failures are logged by the caller and never propagated to the writer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, tenant: &str, event_type: &str, record: &AuditRecord) -> Result<(), PublishError>;
}

pub struct NatsEventPublisher {
    jetstream: async_nats::jetstream::Context,
}

impl NatsEventPublisher {
    /// Connects and idempotently ensures the `AUDIT_EVENTS` stream exists
    /// (file-backed, max age 24h, max
    /// 100,000 messages, discard-oldest on overflow).
    pub async fn connect(config: &crate::config::EventBusConfig) -> anyhow::Result<Self> {
        let client = async_nats::connect(config.nats_url()).await?;
        Self::from_client(client, config).await
    }

    /// Shares an already-connected client (e.g. with the live fan-out and
    /// the domain event consumer) instead of opening a second connection.
    pub async fn from_client(
        client: async_nats::Client,
        config: &crate::config::EventBusConfig,
    ) -> anyhow::Result<Self> {
        let jetstream = async_nats::jetstream::new(client);
        jetstream
            .get_or_create_stream(async_nats::jetstream::stream::Config {
                name: config.stream_name().to_string(),
                subjects: vec!["audit.>".to_string()],
                max_age: Duration::from_secs((config.max_age_hours().max(0) as u64) * 3600),
                max_messages: config.max_messages(),
                discard: async_nats::jetstream::stream::DiscardPolicy::Old,
                storage: async_nats::jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await?;
        Ok(Self { jetstream })
    }
}

#[async_trait]
impl EventPublisher for NatsEventPublisher {
    async fn publish(&self, tenant: &str, event_type: &str, record: &AuditRecord) -> Result<(), PublishError> {
        let subject = format!("audit.{tenant}.{event_type}");
        let body = serde_json::json!({
            "type": event_type,
            "tenant_id": tenant,
            "log": record,
        });
        let payload =
            serde_json::to_vec(&body).map_err(|e| PublishError::Publish(e.to_string()))?;
        let ack_future = self
            .jetstream
            .publish(subject, payload.into())
            .await
            .map_err(|e| PublishError::Publish(e.to_string()))?;
        ack_future
            .await
            .map_err(|e| PublishError::Publish(e.to_string()))?;
        Ok(())
    }
}

/// Thin policy layer atop the repository.
pub struct AuditService {
    repository: Arc<dyn AuditRepository>,
    publisher: Arc<dyn EventPublisher>,
}

impl AuditService {
    pub fn new(repository: Arc<dyn AuditRepository>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { repository, publisher }
    }

    /// A record is alertable when CRITICAL severity, a failed authentication
    /// attempt, or any RBAC-category action.
    pub fn is_alertable(record: &AuditRecord) -> bool {
        record.severity == Severity::Critical
            || (record.action.is_auth_verb() && record.outcome == crate::common::types::Outcome::Failure)
            || record.action.is_rbac_verb()
    }

    fn fan_out(&self, tenant: &str, event_type: &'static str, record: AuditRecord) {
        let publisher = self.publisher.clone();
        let tenant = tenant.to_string();
        tokio::spawn(async move {
            if let Err(e) = publisher.publish(&tenant, event_type, &record).await {
                warn!(tenant, "failed to publish audit event to outbound fabric: {e}");
            }
        });
    }

    pub async fn create(&self, tenant: &str, mut record: NewAuditRecord) -> RepositoryResult<AuditRecord> {
        if record.occurred_at.is_none() {
            record.occurred_at = Some(Utc::now());
        }
        let stored = self.repository.create(tenant, record).await?;
        if Self::is_alertable(&stored) {
            tracing::warn!(
                tenant,
                id = %stored.id,
                action = %stored.action,
                resource = %stored.resource,
                "alertable audit event"
            );
        }
        self.fan_out(tenant, "created", stored.clone());
        Ok(stored)
    }

    pub async fn get_by_id(&self, tenant: &str, id: Uuid) -> RepositoryResult<AuditRecord> {
        self.repository.get_by_id(tenant, id).await
    }

    pub async fn list(
        &self,
        tenant: &str,
        filter: &AuditFilter,
        order_by: &str,
        order_dir: &str,
        limit: i64,
        offset: i64,
    ) -> RepositoryResult<(Vec<AuditRecord>, i64)> {
        self.repository
            .list(tenant, filter, order_by, order_dir, limit, offset)
            .await
    }

    pub async fn get_resource_history(
        &self,
        tenant: &str,
        resource: &str,
        resource_id: &str,
    ) -> RepositoryResult<Vec<AuditRecord>> {
        self.repository.get_resource_history(tenant, resource, resource_id).await
    }

    pub async fn get_user_activity(
        &self,
        tenant: &str,
        user_id: &str,
        limit: i64,
    ) -> RepositoryResult<Vec<AuditRecord>> {
        self.repository.get_user_activity(tenant, user_id, limit).await
    }

    pub async fn get_critical_events(&self, tenant: &str, hours: i64) -> RepositoryResult<Vec<AuditRecord>> {
        self.repository.get_critical_events(tenant, hours).await
    }

    pub async fn get_failed_auth(&self, tenant: &str, hours: i64) -> RepositoryResult<Vec<AuditRecord>> {
        self.repository.get_failed_auth(tenant, hours).await
    }

    pub async fn get_suspicious(&self, tenant: &str) -> RepositoryResult<Vec<AuditRecord>> {
        self.repository.get_suspicious(tenant).await
    }

    pub async fn ip_history(
        &self,
        tenant: &str,
        user_id: &str,
    ) -> RepositoryResult<Vec<crate::audit::model::IpHistoryEntry>> {
        self.repository.ip_history(tenant, user_id).await
    }

    pub async fn recent_logs(&self, tenant: &str, limit: i64) -> RepositoryResult<Vec<AuditRecord>> {
        self.repository.recent_logs(tenant, limit).await
    }

    pub async fn summary(
        &self,
        tenant: &str,
        from: chrono::DateTime<Utc>,
        to: chrono::DateTime<Utc>,
    ) -> RepositoryResult<AuditSummary> {
        self.repository.summary(tenant, from, to).await
    }

    pub async fn cleanup(&self, tenant: &str, days: i32) -> RepositoryResult<i64> {
        self.repository.cleanup(tenant, days).await
    }

    pub async fn get_retention(&self, tenant: &str) -> RepositoryResult<RetentionSetting> {
        self.repository.get_retention(tenant).await
    }

    pub async fn set_retention(&self, tenant: &str, days: i32) -> RepositoryResult<RetentionSetting> {
        self.repository.set_retention(tenant, days).await
    }

    pub async fn export(&self, tenant: &str, filter: &AuditFilter) -> RepositoryResult<Vec<AuditRecord>> {
        self.repository.export(tenant, filter).await
    }

    /// Indented JSON export.
    pub fn render_json(records: &[AuditRecord]) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(records)
    }

    /// CSV export with a fixed header row; no field may silently shift the
    /// column order.
    pub fn render_csv(records: &[AuditRecord]) -> String {
        const HEADER: &str = "id,tenant_id,user_id,username,action,resource,resource_id,outcome,severity,client_address,service_name,description,occurred_at,created_at";
        let mut out = String::from(HEADER);
        out.push('\n');
        for r in records {
            out.push_str(&csv_escape(&r.id.to_string()));
            out.push(',');
            out.push_str(&csv_escape(&r.tenant_id));
            out.push(',');
            out.push_str(&csv_escape(r.user_id.as_deref().unwrap_or("")));
            out.push(',');
            out.push_str(&csv_escape(r.username.as_deref().unwrap_or("")));
            out.push(',');
            out.push_str(&csv_escape(&r.action.to_string()));
            out.push(',');
            out.push_str(&csv_escape(&r.resource.to_string()));
            out.push(',');
            out.push_str(&csv_escape(r.resource_id.as_deref().unwrap_or("")));
            out.push(',');
            out.push_str(&csv_escape(&r.outcome.to_string()));
            out.push(',');
            out.push_str(&csv_escape(&r.severity.to_string()));
            out.push(',');
            out.push_str(&csv_escape(r.client_address.as_deref().unwrap_or("")));
            out.push(',');
            out.push_str(&csv_escape(r.service_name.as_deref().unwrap_or("")));
            out.push(',');
            out.push_str(&csv_escape(r.description.as_deref().unwrap_or("")));
            out.push(',');
            out.push_str(&csv_escape(&r.occurred_at.to_rfc3339()));
            out.push(',');
            out.push_str(&csv_escape(&r.created_at.to_rfc3339()));
            out.push('\n');
        }
        out
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::repository::MockAuditRepository;
    use crate::common::types::{Action, Outcome, Resource};
    use pretty_assertions::assert_eq;

    fn test_record(severity: Severity, action: Action, outcome: Outcome) -> AuditRecord {
        AuditRecord {
            id: Uuid::nil(),
            tenant_id: "t1".to_string(),
            user_id: None,
            username: None,
            user_email: None,
            action,
            resource: Resource::Order,
            resource_id: None,
            resource_name: None,
            outcome,
            severity,
            method: None,
            path: None,
            query_string: None,
            client_address: None,
            user_agent: None,
            correlation_id: None,
            old_value: None,
            new_value: None,
            diff: None,
            description: Some("a description, with a comma".to_string()),
            metadata: None,
            tags: None,
            error_message: None,
            error_code: None,
            service_name: None,
            service_version: None,
            occurred_at: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn critical_severity_is_alertable() {
        let r = test_record(Severity::Critical, Action::Create, Outcome::Success);
        assert!(AuditService::is_alertable(&r));
    }

    #[test]
    fn failed_login_is_alertable() {
        let r = test_record(Severity::Low, Action::Login, Outcome::Failure);
        assert!(AuditService::is_alertable(&r));
    }

    #[test]
    fn successful_login_is_not_alertable() {
        let r = test_record(Severity::Low, Action::Login, Outcome::Success);
        assert!(!AuditService::is_alertable(&r));
    }

    #[test]
    fn rbac_action_is_alertable() {
        let r = test_record(Severity::Low, Action::RoleChange, Outcome::Success);
        assert!(AuditService::is_alertable(&r));
    }

    #[test]
    fn ordinary_create_is_not_alertable() {
        let r = test_record(Severity::Low, Action::Create, Outcome::Success);
        assert!(!AuditService::is_alertable(&r));
    }

    #[test]
    fn csv_export_escapes_commas_and_keeps_header_order() {
        let records = vec![test_record(Severity::Low, Action::Create, Outcome::Success)];
        let csv = AuditService::render_csv(&records);
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "id,tenant_id,user_id,username,action,resource,resource_id,outcome,severity,client_address,service_name,description,occurred_at,created_at"
        );
        assert!(lines.next().unwrap().contains("\"a description, with a comma\""));
    }

    #[test]
    fn json_export_round_trips_as_array() {
        let records = vec![test_record(Severity::Low, Action::Create, Outcome::Success)];
        let json = AuditService::render_json(&records).unwrap();
        let parsed: Vec<AuditRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].tenant_id, "t1");
    }

    #[tokio::test]
    async fn create_defaults_occurred_at_and_publishes() {
        let mut repo = MockAuditRepository::new();
        repo.expect_create()
            .withf(|_, record: &NewAuditRecord| record.occurred_at.is_some())
            .returning(|_, _| Ok(test_record(Severity::Medium, Action::Create, Outcome::Success)));
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let service = AuditService::new(Arc::new(repo), Arc::new(publisher));
        let result = service.create("t1", NewAuditRecord::default()).await;
        assert!(result.is_ok());
        // let the spawned fan-out task run before the mock's expectations are checked on drop
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
