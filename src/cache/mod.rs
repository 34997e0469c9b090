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

use crate::audit::model::{AuditRecord, AuditSummary};
use crate::common::cache::TtlCache;
use crate::common::error::RepositoryError;
use crate::config::CacheConfig;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Cached payload for a single `list` page: the records plus the total
/// matching row count, since both are needed to render the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPage {
    pub records: Vec<AuditRecord>,
    pub total: i64,
}

/// Tiered cache in front of the audit repository. L1 is a
/// process-local [`TtlCache`]; L2 is a shared Redis tier. List-page keys
/// carry a digest of the filter map so distinct filter combinations land
/// under distinct keys; summary entries skip L1 because they are large.
pub struct AuditCache {
    l1_records: TtlCache<(String, Uuid), AuditRecord>,
    l1_list: TtlCache<(String, String), ListPage>,
    l1_critical: TtlCache<(String, i64), Vec<AuditRecord>>,
    l1_recent: Mutex<std::collections::HashMap<String, VecDeque<(AuditRecord, Instant)>>>,
    l2: Option<Mutex<MultiplexedConnection>>,
    default_ttl: Duration,
    summary_ttl: Duration,
    critical_ttl: Duration,
    recent_cap: usize,
    recent_ttl: Duration,
}

const RECENT_CAP_HARD_MAX: usize = 100;

impl AuditCache {
    pub fn new(config: &CacheConfig, l2: Option<MultiplexedConnection>) -> Self {
        Self {
            l1_records: TtlCache::new(config.l1_capacity()),
            l1_list: TtlCache::new(config.l1_capacity()),
            l1_critical: TtlCache::new(config.l1_capacity()),
            l1_recent: Mutex::new(std::collections::HashMap::new()),
            l2: l2.map(Mutex::new),
            default_ttl: config.default_ttl(),
            summary_ttl: config.summary_ttl(),
            critical_ttl: config.critical_ttl(),
            recent_cap: config.recent_logs_cap().min(RECENT_CAP_HARD_MAX),
            recent_ttl: config.recent_logs_ttl(),
        }
    }

    fn record_key(tenant: &str, id: Uuid) -> String {
        format!("audit:record:{tenant}:{id}")
    }

    fn list_key(tenant: &str, digest: &str) -> String {
        format!("audit:list:{tenant}:{digest}")
    }

    fn summary_key(tenant: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> String {
        format!("audit:summary:{tenant}:{}:{}", from.timestamp(), to.timestamp())
    }

    fn critical_key(tenant: &str, hours: i64) -> String {
        format!("audit:critical:{tenant}:{hours}")
    }

    fn recent_key(tenant: &str) -> String {
        format!("audit:recent:{tenant}")
    }

    pub fn get_record(&self, tenant: &str, id: Uuid) -> Result<Option<AuditRecord>, RepositoryError> {
        self.l1_records.get(&(tenant.to_string(), id))
    }

    pub fn set_record(&self, tenant: &str, record: &AuditRecord) -> Result<(), RepositoryError> {
        self.l1_records.insert(
            (tenant.to_string(), record.id),
            record.clone(),
            self.default_ttl,
        )
    }

    /// Prepend to the bounded recent-logs ring, also dropping entries past
    /// `recent_ttl` so the ring both caps at a count and expires by age.
    pub fn push_recent(&self, tenant: &str, record: AuditRecord) -> Result<(), RepositoryError> {
        let mut guard = self
            .l1_recent
            .lock()
            .map_err(|e| RepositoryError::RwLockWriteGuard(e.to_string()))?;
        let ring = guard.entry(tenant.to_string()).or_default();
        ring.push_front((record, Instant::now()));
        while ring.len() > self.recent_cap {
            ring.pop_back();
        }
        self.evict_expired_recent(ring);
        Ok(())
    }

    fn evict_expired_recent(&self, ring: &mut VecDeque<(AuditRecord, Instant)>) {
        while ring
            .back()
            .is_some_and(|(_, inserted_at)| inserted_at.elapsed() >= self.recent_ttl)
        {
            ring.pop_back();
        }
    }

    pub fn get_recent(&self, tenant: &str, limit: usize) -> Result<Option<Vec<AuditRecord>>, RepositoryError> {
        let mut guard = self
            .l1_recent
            .lock()
            .map_err(|e| RepositoryError::RwLockWriteGuard(e.to_string()))?;
        if let Some(ring) = guard.get_mut(tenant) {
            self.evict_expired_recent(ring);
            return Ok(Some(ring.iter().take(limit).map(|(r, _)| r.clone()).collect()));
        }
        Ok(None)
    }

    /// Used by the live fan-out's fallback polling path.
    pub fn recent_since(&self, tenant: &str, newer_than: DateTime<Utc>) -> Result<Vec<AuditRecord>, RepositoryError> {
        let mut guard = self
            .l1_recent
            .lock()
            .map_err(|e| RepositoryError::RwLockWriteGuard(e.to_string()))?;
        Ok(guard
            .get_mut(tenant)
            .map(|ring| {
                self.evict_expired_recent(ring);
                ring.iter()
                    .filter(|(r, _)| r.occurred_at > newer_than)
                    .map(|(r, _)| r.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn get_list(
        &self,
        tenant: &str,
        filter_digest: &str,
    ) -> Result<Option<ListPage>, RepositoryError> {
        let l1_key = (tenant.to_string(), filter_digest.to_string());
        if let Some(page) = self.l1_list.get(&l1_key)? {
            return Ok(Some(page));
        }

        let Some(l2) = &self.l2 else { return Ok(None) };
        let key = Self::list_key(tenant, filter_digest);
        let mut conn = l2.lock().map_err(|e| RepositoryError::RwLockReadGuard(e.to_string()))?.clone();
        let raw: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| RepositoryError::Custom(e.to_string()))?;
        match raw {
            Some(json) => {
                let page: ListPage =
                    serde_json::from_str(&json).map_err(|e| RepositoryError::Custom(e.to_string()))?;
                self.l1_list.insert(l1_key, page.clone(), self.default_ttl)?;
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }

    pub async fn set_list(
        &self,
        tenant: &str,
        filter_digest: &str,
        page: &ListPage,
    ) -> Result<(), RepositoryError> {
        self.l1_list.insert(
            (tenant.to_string(), filter_digest.to_string()),
            page.clone(),
            self.default_ttl,
        )?;

        let Some(l2) = &self.l2 else { return Ok(()) };
        let key = Self::list_key(tenant, filter_digest);
        let payload = serde_json::to_string(page).map_err(|e| RepositoryError::Custom(e.to_string()))?;
        let mut conn = l2.lock().map_err(|e| RepositoryError::RwLockWriteGuard(e.to_string()))?.clone();
        let _: () = conn
            .set_ex(&key, payload, self.default_ttl.as_secs())
            .await
            .map_err(|e| RepositoryError::Custom(e.to_string()))?;
        Ok(())
    }

    pub async fn get_critical(
        &self,
        tenant: &str,
        hours: i64,
    ) -> Result<Option<Vec<AuditRecord>>, RepositoryError> {
        let l1_key = (tenant.to_string(), hours);
        if let Some(records) = self.l1_critical.get(&l1_key)? {
            return Ok(Some(records));
        }

        let Some(l2) = &self.l2 else { return Ok(None) };
        let key = Self::critical_key(tenant, hours);
        let mut conn = l2.lock().map_err(|e| RepositoryError::RwLockReadGuard(e.to_string()))?.clone();
        let raw: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| RepositoryError::Custom(e.to_string()))?;
        match raw {
            Some(json) => {
                let records: Vec<AuditRecord> =
                    serde_json::from_str(&json).map_err(|e| RepositoryError::Custom(e.to_string()))?;
                self.l1_critical.insert(l1_key, records.clone(), self.critical_ttl)?;
                Ok(Some(records))
            }
            None => Ok(None),
        }
    }

    pub async fn set_critical(
        &self,
        tenant: &str,
        hours: i64,
        records: &[AuditRecord],
    ) -> Result<(), RepositoryError> {
        self.l1_critical
            .insert((tenant.to_string(), hours), records.to_vec(), self.critical_ttl)?;

        let Some(l2) = &self.l2 else { return Ok(()) };
        let key = Self::critical_key(tenant, hours);
        let payload = serde_json::to_string(records).map_err(|e| RepositoryError::Custom(e.to_string()))?;
        let mut conn = l2.lock().map_err(|e| RepositoryError::RwLockWriteGuard(e.to_string()))?.clone();
        let _: () = conn
            .set_ex(&key, payload, self.critical_ttl.as_secs())
            .await
            .map_err(|e| RepositoryError::Custom(e.to_string()))?;
        Ok(())
    }

    pub async fn get_summary(
        &self,
        tenant: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<AuditSummary>, RepositoryError> {
        let Some(l2) = &self.l2 else { return Ok(None) };
        let key = Self::summary_key(tenant, from, to);
        let mut conn = l2.lock().map_err(|e| RepositoryError::RwLockReadGuard(e.to_string()))?.clone();
        let raw: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| RepositoryError::Custom(e.to_string()))?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| RepositoryError::Custom(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn set_summary(
        &self,
        tenant: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        summary: &AuditSummary,
    ) -> Result<(), RepositoryError> {
        let Some(l2) = &self.l2 else { return Ok(()) };
        let key = Self::summary_key(tenant, from, to);
        let payload = serde_json::to_string(summary).map_err(|e| RepositoryError::Custom(e.to_string()))?;
        let mut conn = l2.lock().map_err(|e| RepositoryError::RwLockWriteGuard(e.to_string()))?.clone();
        let _: () = conn
            .set_ex(&key, payload, self.summary_ttl.as_secs())
            .await
            .map_err(|e| RepositoryError::Custom(e.to_string()))?;
        Ok(())
    }

    /// `invalidate(tenant)` — drops every tier for the tenant.
    pub fn invalidate_all(&self, tenant: &str) -> Result<(), RepositoryError> {
        let prefix = format!("{tenant}");
        self.l1_records
            .invalidate_matching(|(t, _)| t == &prefix)?;
        self.l1_list.invalidate_matching(|(t, _)| t == &prefix)?;
        self.l1_critical
            .invalidate_matching(|(t, _)| t == &prefix)?;
        let mut guard = self
            .l1_recent
            .lock()
            .map_err(|e| RepositoryError::RwLockWriteGuard(e.to_string()))?;
        guard.remove(tenant);
        Ok(())
    }

    /// `invalidate-after-write(tenant)` — scrubs the tenant's list/critical
    /// entries from L1 (summary has no L1 tier) and scans list/summary/
    /// critical/recent keys on L2; single-record keys survive since the new
    /// record becomes its own valid cache entry.
    pub async fn invalidate_after_write(&self, tenant: &str) -> Result<(), RepositoryError> {
        let prefix = tenant.to_string();
        self.l1_list.invalidate_matching(|(t, _)| t == &prefix)?;
        self.l1_critical
            .invalidate_matching(|(t, _)| t == &prefix)?;

        let Some(l2) = &self.l2 else { return Ok(()) };
        let patterns = [
            format!("audit:list:{tenant}:*"),
            format!("audit:summary:{tenant}:*"),
            format!("audit:critical:{tenant}:*"),
            Self::recent_key(tenant),
        ];
        let mut conn = l2.lock().map_err(|e| RepositoryError::RwLockWriteGuard(e.to_string()))?.clone();
        for pattern in patterns {
            let keys: Vec<String> = conn
                .keys(&pattern)
                .await
                .map_err(|e| RepositoryError::Custom(e.to_string()))?;
            if !keys.is_empty() {
                let _: () = conn
                    .del(&keys)
                    .await
                    .map_err(|e| RepositoryError::Custom(e.to_string()))?;
            }
        }
        Ok(())
    }
}

/// Stable digest of a filter map so independent filter combinations get
/// distinct list-page cache keys.
pub mod filter_digest {
    use std::collections::BTreeMap;
    use std::hash::{Hash, Hasher};

    pub fn digest_filter_key(pairs: &[(&str, Option<String>)]) -> String {
        let sorted: BTreeMap<&str, Option<String>> = pairs.iter().cloned().collect();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for (k, v) in &sorted {
            k.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        format!("{:016x}", hasher.finish())
    }
}

pub use filter_digest::digest_filter_key;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_for_same_filter() {
        let a = digest_filter_key(&[("action", Some("CREATE".into())), ("resource", None)]);
        let b = digest_filter_key(&[("resource", None), ("action", Some("CREATE".into()))]);
        assert_eq!(a, b);
    }

    #[test]
    fn digest_differs_for_different_filter() {
        let a = digest_filter_key(&[("action", Some("CREATE".into()))]);
        let b = digest_filter_key(&[("action", Some("DELETE".into()))]);
        assert_ne!(a, b);
    }

    #[test]
    fn recent_ring_caps_at_configured_size() {
        let cache = AuditCache {
            l1_records: TtlCache::new(10),
            l1_list: TtlCache::new(10),
            l1_critical: TtlCache::new(10),
            l1_recent: Mutex::new(std::collections::HashMap::new()),
            l2: None,
            default_ttl: Duration::from_secs(1),
            summary_ttl: Duration::from_secs(1),
            critical_ttl: Duration::from_secs(1),
            recent_cap: 2,
            recent_ttl: Duration::from_secs(1),
        };
        for i in 0..5 {
            let mut record = test_record();
            record.id = Uuid::from_u128(i);
            cache.push_recent("t1", record).unwrap();
        }
        assert_eq!(cache.get_recent("t1", 10).unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn list_and_critical_tiers_fall_back_to_l1_without_l2() {
        let cache = AuditCache {
            l1_records: TtlCache::new(10),
            l1_list: TtlCache::new(10),
            l1_critical: TtlCache::new(10),
            l1_recent: Mutex::new(std::collections::HashMap::new()),
            l2: None,
            default_ttl: Duration::from_secs(1),
            summary_ttl: Duration::from_secs(1),
            critical_ttl: Duration::from_secs(1),
            recent_cap: 2,
            recent_ttl: Duration::from_secs(1),
        };
        assert!(cache.get_list("t1", "digest").await.unwrap().is_none());
        cache
            .set_list(
                "t1",
                "digest",
                &ListPage {
                    records: vec![test_record()],
                    total: 1,
                },
            )
            .await
            .unwrap();
        // no L2 configured, but set_list also writes through to L1 directly
        assert_eq!(cache.get_list("t1", "digest").await.unwrap().unwrap().total, 1);

        assert!(cache.get_critical("t1", 24).await.unwrap().is_none());
        cache.set_critical("t1", 24, &[test_record()]).await.unwrap();
        assert_eq!(cache.get_critical("t1", 24).await.unwrap().unwrap().len(), 1);
    }

    fn test_record() -> AuditRecord {
        use crate::common::types::{Action, Outcome, Resource, Severity};
        AuditRecord {
            id: Uuid::nil(),
            tenant_id: "t1".to_string(),
            user_id: None,
            username: None,
            user_email: None,
            action: Action::Create,
            resource: Resource::Order,
            resource_id: None,
            resource_name: None,
            outcome: Outcome::Success,
            severity: Severity::Low,
            method: None,
            path: None,
            query_string: None,
            client_address: None,
            user_agent: None,
            correlation_id: None,
            old_value: None,
            new_value: None,
            diff: None,
            description: None,
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
}
