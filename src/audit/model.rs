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

use crate::common::types::{Action, Outcome, Resource, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One immutable row describing one audited action. Once
/// persisted there is no update path; expiry happens only via retention.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditRecord {
    pub id: Uuid,
    pub tenant_id: String,

    pub user_id: Option<String>,
    pub username: Option<String>,
    pub user_email: Option<String>,

    pub action: Action,
    pub resource: Resource,
    pub resource_id: Option<String>,
    pub resource_name: Option<String>,

    pub outcome: Outcome,
    pub severity: Severity,

    pub method: Option<String>,
    pub path: Option<String>,
    pub query_string: Option<String>,
    pub client_address: Option<String>,
    pub user_agent: Option<String>,
    pub correlation_id: Option<String>,

    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub diff: Option<Value>,

    pub description: Option<String>,
    pub metadata: Option<Value>,
    pub tags: Option<Vec<String>>,

    pub error_message: Option<String>,
    pub error_code: Option<String>,

    pub service_name: Option<String>,
    pub service_version: Option<String>,

    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Inbound shape for `POST /api/v1/audit-logs` and for records assembled by
/// the domain-event translator. `id` and `created_at` are server-assigned.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewAuditRecord {
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub user_email: Option<String>,

    pub action: Option<Action>,
    pub resource: Option<Resource>,
    pub resource_id: Option<String>,
    pub resource_name: Option<String>,

    pub outcome: Option<Outcome>,
    pub severity: Option<Severity>,

    pub method: Option<String>,
    pub path: Option<String>,
    pub query_string: Option<String>,
    pub client_address: Option<String>,
    pub user_agent: Option<String>,
    pub correlation_id: Option<String>,

    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub diff: Option<Value>,

    pub description: Option<String>,
    pub metadata: Option<Value>,
    pub tags: Option<Vec<String>>,

    pub error_message: Option<String>,
    pub error_code: Option<String>,

    pub service_name: Option<String>,
    pub service_version: Option<String>,

    pub occurred_at: Option<DateTime<Utc>>,
}

/// Filter shape shared by `list` and `export`.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub action: Option<Action>,
    pub resource: Option<Resource>,
    pub resource_id: Option<String>,
    pub outcome: Option<Outcome>,
    pub severity: Option<Severity>,
    pub user_id: Option<String>,
    pub client_address: Option<String>,
    pub service_name: Option<String>,
    pub search: Option<String>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IpHistoryEntry {
    pub address: String,
    pub count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserActivityCount {
    pub user_id: String,
    pub count: i64,
    pub last_activity: DateTime<Utc>,
}

/// Totals plus the five grouped histograms returned by `summary`.
#[derive(Debug, Clone, Serialize)]
pub struct AuditSummary {
    pub total_logs: i64,
    pub by_action: std::collections::HashMap<String, i64>,
    pub by_resource: std::collections::HashMap<String, i64>,
    pub by_outcome: std::collections::HashMap<String, i64>,
    pub by_severity: std::collections::HashMap<String, i64>,
    pub top_users: Vec<UserActivityCount>,
    pub recent_failures: Vec<AuditRecord>,
}

/// Per-tenant retention policy.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RetentionSetting {
    pub tenant_id: String,
    pub retention_days: i32,
    pub last_cleanup_at: Option<DateTime<Utc>>,
    pub logs_deleted_last_run: i64,
}

pub const MIN_RETENTION_DAYS: i32 = 90;
pub const MAX_RETENTION_DAYS: i32 = 365;
pub const DEFAULT_RETENTION_DAYS: i32 = 180;

pub fn clamp_retention_days(days: i32) -> i32 {
    days.clamp(MIN_RETENTION_DAYS, MAX_RETENTION_DAYS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_below_minimum() {
        assert_eq!(clamp_retention_days(10), MIN_RETENTION_DAYS);
    }

    #[test]
    fn clamps_above_maximum() {
        assert_eq!(clamp_retention_days(10_000), MAX_RETENTION_DAYS);
    }

    #[test]
    fn leaves_in_range_value_untouched() {
        assert_eq!(clamp_retention_days(200), 200);
    }
}
