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

use crate::audit::repository::{AuditRepository, PgAuditRepository};
use crate::audit::service::{AuditService, EventPublisher, NatsEventPublisher};
use crate::cache::AuditCache;
use crate::config::AppConfig;
use crate::connection::{ConnectionManager, PgConnectionManager};
use crate::ingestion::DomainEventConsumer;
use crate::live::LiveFanout;
use crate::registry::{DefaultTenantRegistry, HttpUpstreamRegistryClient, TenantRegistry};
use crate::retention::RetentionScheduler;
use axum::Router;
use base64::Engine;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Shared handles every HTTP handler needs; everything tenant-specific
/// (pools, cached entries, circuit state) lives behind these, keyed by the
/// `x-tenant-id` header at the point of use.
pub struct AppState {
    pub audit_service: Arc<AuditService>,
    pub live_fanout: Arc<LiveFanout>,
}

pub fn init_subscriber() {
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(Level::INFO).finish(),
    )
    .expect("setting default subscriber failed");
}

/// Background tasks spawned alongside the HTTP server; held so their join
/// handles outlive `main`'s scope and the cancellation token can be reached
/// at shutdown.
pub struct Background {
    cancel: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Background {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

pub async fn bootstrap() -> anyhow::Result<(Arc<AppConfig>, Router, Background)> {
    let config = Arc::new(AppConfig::from_env()?);
    let cancel = CancellationToken::new();
    let mut handles = Vec::new();

    let redis_client = redis::Client::open(config.cache().redis_url())?;
    let redis_conn = match redis_client.get_multiplexed_tokio_connection().await {
        Ok(conn) => Some(conn),
        Err(e) => {
            tracing::warn!("shared cache tier unavailable at startup, running L1-only: {e}");
            None
        }
    };

    let upstream = Arc::new(HttpUpstreamRegistryClient::new(
        config.registry().upstream_url().to_string(),
    ));
    let encryption_key = base64::engine::general_purpose::STANDARD
        .decode(config.crypto().tenant_encryption_key_b64())?;
    let registry: Arc<dyn TenantRegistry> = Arc::new(DefaultTenantRegistry::new(
        upstream,
        config.registry().clone(),
        encryption_key,
        redis_conn.clone(),
    )?);

    let pg_connections = Arc::new(
        PgConnectionManager::new(registry.clone(), config.connection().clone()).await?,
    );
    let connections: Arc<dyn ConnectionManager> = pg_connections.clone();

    let cache = Arc::new(AuditCache::new(config.cache(), redis_conn));

    let repository: Arc<dyn AuditRepository> =
        Arc::new(PgAuditRepository::new(connections.clone(), cache.clone()));

    let nats_client = async_nats::connect(config.event_bus().nats_url()).await?;
    let publisher: Arc<dyn EventPublisher> = Arc::new(
        NatsEventPublisher::from_client(nats_client.clone(), config.event_bus()).await?,
    );

    let audit_service = Arc::new(AuditService::new(repository.clone(), publisher));
    let live_fanout = LiveFanout::new(Some(nats_client.clone()), cache.clone(), audit_service.clone());

    let jetstream = async_nats::jetstream::new(nats_client);
    let consumer = DomainEventConsumer::new(jetstream, audit_service.clone());
    handles.push(tokio::spawn(consumer.run(cancel.clone())));

    handles.push(tokio::spawn(crate::registry::refresh_loop(
        registry.clone(),
        config.registry().local_ttl(),
        cancel.clone(),
    )));

    handles.push(tokio::spawn(crate::connection::cleanup_loop(
        pg_connections.clone(),
        cancel.clone(),
    )));
    handles.push(tokio::spawn(crate::connection::health_check_loop(
        pg_connections,
        cancel.clone(),
    )));

    let scheduler = RetentionScheduler::new(registry, repository, config.retention().clone());
    let scheduler_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = scheduler.run(scheduler_cancel).await {
            tracing::error!("retention scheduler exited: {e}");
        }
    }));

    let state = Arc::new(AppState {
        audit_service,
        live_fanout,
    });

    let router = Router::new()
        .nest("/api/v1", crate::audit::routes::routes(state))
        .layer(TraceLayer::new_for_http());

    Ok((config, router, Background { cancel, handles }))
}
