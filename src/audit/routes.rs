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

use crate::audit::handler;
use crate::app::AppState;
use axum::Router;
use axum::routing::{get, post, put};
use std::sync::Arc;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new().nest(
        "/audit-logs",
        Router::new()
            .route("/", post(handler::create).get(handler::list))
            .route("/summary", get(handler::summary))
            .route("/critical", get(handler::critical))
            .route("/failed-auth", get(handler::failed_auth))
            .route("/suspicious-activity", get(handler::suspicious_activity))
            .route("/resource/{resource_type}/{resource_id}", get(handler::resource_history))
            .route("/user/{user_id}", get(handler::user_activity))
            .route("/user/{user_id}/ip-history", get(handler::ip_history))
            .route("/recent", get(handler::recent))
            .route("/stream", get(handler::stream))
            .route("/export", get(handler::export))
            .route("/retention", get(handler::get_retention).put(handler::set_retention))
            .route("/cleanup", post(handler::cleanup))
            .route("/{id}", get(handler::get_one))
            .with_state(state),
    )
}
