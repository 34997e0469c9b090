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

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Shape returned on any non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse<T: Serialize> {
    #[serde(skip)]
    pub status_code: StatusCode,
    pub error: T,
}

impl<T: Serialize> IntoResponse for ErrorResponse<T> {
    fn into_response(self) -> Response {
        (self.status_code, Json(self.error)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct GeneralError {
    pub message: String,
}

impl Display for GeneralError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Debug, Serialize)]
pub struct FormError<'a, T: Serialize + Display> {
    pub message: String,
    pub fields: &'a T,
}

impl<'a, T: Serialize + Display> Display for FormError<'a, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.message, self.fields)
    }
}

/// Uniform success envelope for handlers.
#[derive(Debug, Serialize)]
pub struct OkResponse<D: Serialize> {
    #[serde(skip)]
    pub status_code: StatusCode,
    pub data: D,
}

impl<D: Serialize> IntoResponse for OkResponse<D> {
    fn into_response(self) -> Response {
        (self.status_code, Json(self.data)).into_response()
    }
}

pub struct OkResponseBuilder<D: Serialize> {
    status_code: StatusCode,
    data: Option<D>,
}

impl<D: Serialize> Default for OkResponseBuilder<D> {
    fn default() -> Self {
        Self {
            status_code: StatusCode::OK,
            data: None,
        }
    }
}

impl<D: Serialize> OkResponseBuilder<D> {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn status_code(mut self, status_code: StatusCode) -> Self {
        self.status_code = status_code;
        self
    }
    pub fn data(mut self, data: D) -> Self {
        self.data = Some(data);
        self
    }
    pub fn build(self) -> Result<OkResponse<D>, crate::common::error::BuilderError> {
        Ok(OkResponse {
            status_code: self.status_code,
            data: self
                .data
                .ok_or(crate::common::error::BuilderError::MissingRequired("data"))?,
        })
    }
}

/// Alias used throughout handlers: either a ready `Response`, or one already
/// converted from a `FriendlyError`.
pub type HandlerResult = Result<Response, Response>;

/// Raw query-string parameters for list endpoints before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryParam {
    pub action: Option<String>,
    pub resource: Option<String>,
    pub resource_id: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<String>,
    pub severity: Option<String>,
    pub ip_address: Option<String>,
    pub service_name: Option<String>,
    pub search: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub hours: Option<i64>,
    pub format: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PaginatorParams {
    pub limit: i64,
    pub offset: i64,
}

impl Default for PaginatorParams {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl From<&QueryParam> for PaginatorParams {
    fn from(value: &QueryParam) -> Self {
        let default = Self::default();
        Self {
            limit: value.limit.unwrap_or(default.limit).clamp(1, 500),
            offset: value.offset.unwrap_or(default.offset).max(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl Default for SortOrder {
    fn default() -> Self {
        Self::Desc
    }
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl From<Option<&str>> for SortOrder {
    fn from(value: Option<&str>) -> Self {
        match value.map(|s| s.to_ascii_lowercase()) {
            Some(s) if s == "asc" => SortOrder::Asc,
            _ => SortOrder::Desc,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderingParams {
    pub order_by: String,
    pub order: SortOrder,
}

impl OrderingParams {
    pub fn from_query(value: &QueryParam, allowed: &[&str], default_field: &str) -> Self {
        let field = value
            .sort_by
            .as_deref()
            .filter(|f| allowed.contains(f))
            .unwrap_or(default_field)
            .to_string();
        Self {
            order_by: field,
            order: SortOrder::from(value.sort_order.as_deref()),
        }
    }
}

/// Page of results plus the total matching row count.
#[derive(Debug, Clone, Serialize)]
pub struct PagedResult<T: Serialize> {
    pub records: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}
