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
use std::fmt::Display;
use thiserror::Error;

use crate::common::dto::{ErrorResponse, FormError, GeneralError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use sqlx::Error;
use sqlx::migrate::MigrateError;
use tracing::Level;
use tracing::event;

/// Error returned to HTTP callers. `UserFacing` carries a stable status code
/// and body that is safe to show; `Internal` is logged in full but rendered
/// to the client as a generic message — no internal detail ever escapes.
#[derive(Debug, Error, Clone)]
pub enum FriendlyError<T>
where
    T: Serialize + Display,
{
    #[error("{0}")]
    UserFacing(StatusCode, String, T),
    #[error("An unexpected error occurred")]
    Internal(String, T),
}

impl<T> FriendlyError<T>
where
    T: Serialize + Display,
{
    pub fn user_facing(severity: Level, status: StatusCode, loc: &str, body: T) -> Self {
        Self::UserFacing(status, loc.to_string(), body).trace(severity)
    }

    pub fn internal(loc: &str, body: T) -> Self {
        Self::Internal(loc.to_string(), body).trace(Level::ERROR)
    }

    fn trace(self, severity: Level) -> Self {
        match &self {
            FriendlyError::UserFacing(status, loc, body) => match severity {
                Level::ERROR => event!(
                    Level::ERROR,
                    "user-facing error: http-status={status} location={loc}, message={body}"
                ),
                Level::WARN => event!(
                    Level::WARN,
                    "user-facing error: http-status={status} location={loc}, message={body}"
                ),
                Level::INFO => event!(
                    Level::INFO,
                    "user-facing error: http-status={status} location={loc}, message={body}"
                ),
                Level::DEBUG => event!(
                    Level::DEBUG,
                    "user-facing error: http-status={status} location={loc}, message={body}"
                ),
                Level::TRACE => event!(
                    Level::TRACE,
                    "user-facing error: http-status={status} location={loc}, message={body}"
                ),
            },
            FriendlyError::Internal(loc, body) => match severity {
                Level::ERROR => {
                    event!(Level::ERROR, "internal error: location={loc} message={body}")
                }
                Level::WARN => {
                    event!(Level::WARN, "internal error: location={loc} message={body}")
                }
                Level::INFO => {
                    event!(Level::INFO, "internal error: location={loc} message={body}")
                }
                Level::DEBUG => {
                    event!(Level::DEBUG, "internal error: location={loc} message={body}")
                }
                Level::TRACE => {
                    event!(Level::TRACE, "internal error: location={loc} message={body}")
                }
            },
        }
        self
    }
}

impl<T> IntoResponse for FriendlyError<T>
where
    T: Serialize + Display,
{
    fn into_response(self) -> Response {
        match self {
            FriendlyError::UserFacing(status, _, body) => ErrorResponse {
                status_code: status,
                error: body,
            }
            .into_response(),
            FriendlyError::Internal(_, _) => ErrorResponse {
                status_code: StatusCode::INTERNAL_SERVER_ERROR,
                error: GeneralError {
                    message: String::from("An unexpected error occurred"),
                },
            }
            .into_response(),
        }
    }
}

pub trait FormErrorResponse: Serialize + Display {
    fn global_message(&self) -> String {
        "Please check the invalid fields".to_string()
    }
    fn status_code(&self) -> StatusCode {
        StatusCode::UNPROCESSABLE_ENTITY
    }
    fn log_level(&self) -> Level {
        Level::DEBUG
    }
    fn get_error_response(&self) -> Response {
        FriendlyError::user_facing(
            self.log_level(),
            self.status_code(),
            file!(),
            FormError {
                message: self.global_message(),
                fields: self,
            },
        )
        .into_response()
    }
}

/// Errors surfaced by repository-layer data access.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migrate error: {0}")]
    Migrate(#[from] MigrateError),

    #[error("InvalidInput error: {0}")]
    InvalidInput(String),

    #[error("Custom error: {0}")]
    Custom(String),

    #[error("RwLockReadGuard error: {0}")]
    RwLockReadGuard(String),

    #[error("RwLockWriteGuard error: {0}")]
    RwLockWriteGuard(String),

    #[error("Record not found")]
    NotFound,

    #[error("Tenant pool not found")]
    TenantPoolNotFound,
}

impl RepositoryError {
    pub fn is_unique_violation(&self) -> bool {
        if let RepositoryError::Database(sqlxe) = self
            && let Error::Database(database_error) = sqlxe
            && database_error.is_unique_violation()
        {
            return true;
        }
        false
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Error, Serialize)]
pub enum BuilderError {
    #[error("{0} is required")]
    MissingRequired(&'static str),
}

impl IntoResponse for BuilderError {
    fn into_response(self) -> Response {
        FriendlyError::internal(file!(), self.to_string()).into_response()
    }
}

pub type BuilderResult<T> = Result<T, BuilderError>;
