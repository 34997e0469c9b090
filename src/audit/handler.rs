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

use crate::audit::model::{AuditFilter, NewAuditRecord, clamp_retention_days};
use crate::common::dto::{HandlerResult, OkResponseBuilder, PaginatorParams, PagedResult, QueryParam};
use crate::common::error::FriendlyError;
use crate::common::extractors::{ClientContext, TenantIdHeader, ValidJson};
use crate::app::AppState;
use axum::debug_handler;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::Level;
use uuid::Uuid;

const ALLOWED_SORT_FIELDS: &[&str] = &["occurred_at", "created_at", "severity", "action"];
const DEFAULT_SORT_FIELD: &str = "occurred_at";
const DEFAULT_CRITICAL_WINDOW_HOURS: i64 = 24;
const DEFAULT_FAILED_AUTH_WINDOW_HOURS: i64 = 24;

fn parse_filter(q: &QueryParam) -> Result<AuditFilter, Response> {
    let bad = |field: &str| {
        FriendlyError::<String>::user_facing(
            Level::DEBUG,
            StatusCode::BAD_REQUEST,
            file!(),
            format!("invalid {field}"),
        )
        .into_response()
    };
    Ok(AuditFilter {
        action: q
            .action
            .as_deref()
            .map(|v| v.parse().map_err(|_| bad("action")))
            .transpose()?,
        resource: q
            .resource
            .as_deref()
            .map(|v| v.parse().map_err(|_| bad("resource")))
            .transpose()?,
        resource_id: q.resource_id.clone(),
        outcome: q
            .status
            .as_deref()
            .map(|v| v.parse().map_err(|_| bad("status")))
            .transpose()?,
        severity: q
            .severity
            .as_deref()
            .map(|v| v.parse().map_err(|_| bad("severity")))
            .transpose()?,
        user_id: q.user_id.clone(),
        client_address: q.ip_address.clone(),
        service_name: q.service_name.clone(),
        search: q.search.clone(),
        from_date: q
            .from_date
            .as_deref()
            .map(|v| DateTime::parse_from_rfc3339(v).map(|d| d.with_timezone(&Utc)).map_err(|_| bad("from_date")))
            .transpose()?,
        to_date: q
            .to_date
            .as_deref()
            .map(|v| DateTime::parse_from_rfc3339(v).map(|d| d.with_timezone(&Utc)).map_err(|_| bad("to_date")))
            .transpose()?,
    })
}

fn ok<D: serde::Serialize>(status: StatusCode, data: D) -> HandlerResult {
    OkResponseBuilder::new()
        .status_code(status)
        .data(data)
        .build()
        .map(IntoResponse::into_response)
        .map_err(IntoResponse::into_response)
}

fn map_repo_err(e: crate::common::error::RepositoryError) -> Response {
    match e {
        crate::common::error::RepositoryError::NotFound => FriendlyError::<String>::user_facing(
            Level::DEBUG,
            StatusCode::NOT_FOUND,
            file!(),
            "audit record not found".to_string(),
        )
        .into_response(),
        crate::common::error::RepositoryError::TenantPoolNotFound => FriendlyError::<String>::user_facing(
            Level::WARN,
            StatusCode::SERVICE_UNAVAILABLE,
            file!(),
            "tenant store unavailable".to_string(),
        )
        .into_response(),
        other => FriendlyError::<String>::internal(file!(), other.to_string()).into_response(),
    }
}

#[debug_handler]
pub async fn create(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
    client: ClientContext,
    ValidJson(mut payload): ValidJson<NewAuditRecord>,
) -> HandlerResult {
    payload.client_address.get_or_insert_with(|| client.ip.to_string());
    if let Some(user_agent) = client.user_agent {
        payload.user_agent.get_or_insert(user_agent);
    }
    let record = state
        .audit_service
        .create(tenant.extract().get_value(), payload)
        .await
        .map_err(map_repo_err)?;
    ok(StatusCode::CREATED, record)
}

#[debug_handler]
pub async fn list(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
    Query(q): Query<QueryParam>,
) -> HandlerResult {
    let filter = parse_filter(&q)?;
    let paging = PaginatorParams::from(&q);
    let ordering = crate::common::dto::OrderingParams::from_query(&q, ALLOWED_SORT_FIELDS, DEFAULT_SORT_FIELD);
    let (records, total) = state
        .audit_service
        .list(
            tenant.extract().get_value(),
            &filter,
            &ordering.order_by,
            ordering.order.as_sql(),
            paging.limit,
            paging.offset,
        )
        .await
        .map_err(map_repo_err)?;
    ok(
        StatusCode::OK,
        PagedResult {
            records,
            total,
            limit: paging.limit,
            offset: paging.offset,
        },
    )
}

#[debug_handler]
pub async fn get_one(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
    Path(id): Path<Uuid>,
) -> HandlerResult {
    let record = state
        .audit_service
        .get_by_id(tenant.extract().get_value(), id)
        .await
        .map_err(map_repo_err)?;
    ok(StatusCode::OK, record)
}

#[derive(Debug, Deserialize)]
pub struct SummaryWindow {
    pub from_date: Option<String>,
    pub to_date: Option<String>,
}

#[debug_handler]
pub async fn summary(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
    Query(q): Query<SummaryWindow>,
) -> HandlerResult {
    let now = Utc::now();
    let parse = |v: &Option<String>, default: DateTime<Utc>| -> Result<DateTime<Utc>, Response> {
        match v {
            Some(s) => DateTime::parse_from_rfc3339(s)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|_| {
                    FriendlyError::<String>::user_facing(
                        Level::DEBUG,
                        StatusCode::BAD_REQUEST,
                        file!(),
                        "invalid date".to_string(),
                    )
                    .into_response()
                }),
            None => Ok(default),
        }
    };
    let from = parse(&q.from_date, now - ChronoDuration::days(30))?;
    let to = parse(&q.to_date, now)?;
    let data = state
        .audit_service
        .summary(tenant.extract().get_value(), from, to)
        .await
        .map_err(map_repo_err)?;
    ok(StatusCode::OK, data)
}

#[derive(Debug, Deserialize, Default)]
pub struct HoursWindow {
    pub hours: Option<i64>,
}

#[debug_handler]
pub async fn critical(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
    Query(q): Query<HoursWindow>,
) -> HandlerResult {
    let data = state
        .audit_service
        .get_critical_events(
            tenant.extract().get_value(),
            q.hours.unwrap_or(DEFAULT_CRITICAL_WINDOW_HOURS),
        )
        .await
        .map_err(map_repo_err)?;
    ok(StatusCode::OK, data)
}

#[debug_handler]
pub async fn failed_auth(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
    Query(q): Query<HoursWindow>,
) -> HandlerResult {
    let data = state
        .audit_service
        .get_failed_auth(
            tenant.extract().get_value(),
            q.hours.unwrap_or(DEFAULT_FAILED_AUTH_WINDOW_HOURS),
        )
        .await
        .map_err(map_repo_err)?;
    ok(StatusCode::OK, data)
}

#[debug_handler]
pub async fn suspicious_activity(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
) -> HandlerResult {
    let data = state
        .audit_service
        .get_suspicious(tenant.extract().get_value())
        .await
        .map_err(map_repo_err)?;
    ok(StatusCode::OK, data)
}

#[debug_handler]
pub async fn resource_history(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
    Path((resource_type, resource_id)): Path<(String, String)>,
) -> HandlerResult {
    let data = state
        .audit_service
        .get_resource_history(tenant.extract().get_value(), &resource_type, &resource_id)
        .await
        .map_err(map_repo_err)?;
    ok(StatusCode::OK, data)
}

#[debug_handler]
pub async fn user_activity(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
    Path(user_id): Path<String>,
    Query(q): Query<PaginatorParams2>,
) -> HandlerResult {
    let data = state
        .audit_service
        .get_user_activity(tenant.extract().get_value(), &user_id, q.limit.unwrap_or(50))
        .await
        .map_err(map_repo_err)?;
    ok(StatusCode::OK, data)
}

#[derive(Debug, Deserialize, Default)]
pub struct PaginatorParams2 {
    pub limit: Option<i64>,
}

#[debug_handler]
pub async fn ip_history(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
    Path(user_id): Path<String>,
) -> HandlerResult {
    let data = state
        .audit_service
        .ip_history(tenant.extract().get_value(), &user_id)
        .await
        .map_err(map_repo_err)?;
    ok(StatusCode::OK, data)
}

#[debug_handler]
pub async fn recent(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
    Query(q): Query<PaginatorParams2>,
) -> HandlerResult {
    let data = state
        .audit_service
        .recent_logs(tenant.extract().get_value(), q.limit.unwrap_or(20))
        .await
        .map_err(map_repo_err)?;
    ok(StatusCode::OK, data)
}

#[debug_handler]
pub async fn stream(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let tenant_id = tenant.extract().get_value().clone();
    Sse::new(state.live_fanout.stream(tenant_id)).keep_alive(KeepAlive::default())
}

#[debug_handler]
pub async fn export(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
    Query(q): Query<QueryParam>,
) -> HandlerResult {
    let filter = parse_filter(&q)?;
    let records = state
        .audit_service
        .export(tenant.extract().get_value(), &filter)
        .await
        .map_err(map_repo_err)?;
    match q.format.as_deref() {
        Some("csv") => {
            let body = crate::audit::service::AuditService::render_csv(&records);
            Ok((
                StatusCode::OK,
                [("content-type", "text/csv")],
                body,
            )
                .into_response())
        }
        _ => {
            let body = crate::audit::service::AuditService::render_json(&records)
                .map_err(|e| FriendlyError::<String>::internal(file!(), e.to_string()).into_response())?;
            Ok((
                StatusCode::OK,
                [("content-type", "application/json")],
                body,
            )
                .into_response())
        }
    }
}

#[debug_handler]
pub async fn get_retention(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
) -> HandlerResult {
    let data = state
        .audit_service
        .get_retention(tenant.extract().get_value())
        .await
        .map_err(map_repo_err)?;
    ok(StatusCode::OK, data)
}

#[derive(Debug, Deserialize)]
pub struct RetentionInput {
    pub retention_days: i32,
}

#[debug_handler]
pub async fn set_retention(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
    ValidJson(payload): ValidJson<RetentionInput>,
) -> HandlerResult {
    let days = clamp_retention_days(payload.retention_days);
    let data = state
        .audit_service
        .set_retention(tenant.extract().get_value(), days)
        .await
        .map_err(map_repo_err)?;
    ok(StatusCode::OK, data)
}

#[debug_handler]
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    TenantIdHeader(tenant): TenantIdHeader,
) -> HandlerResult {
    let setting = state
        .audit_service
        .get_retention(tenant.extract().get_value())
        .await
        .map_err(map_repo_err)?;
    let deleted = state
        .audit_service
        .cleanup(tenant.extract().get_value(), setting.retention_days)
        .await
        .map_err(map_repo_err)?;
    ok(StatusCode::OK, serde_json::json!({"deleted": deleted}))
}
