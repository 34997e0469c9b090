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

use crate::audit::service::AuditService;
use crate::cache::AuditCache;
use axum::response::sse::Event;
use chrono::Utc;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

const QUEUE_CAP: usize = 100;
const INITIAL_BATCH: i64 = 20;
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_IDLE: Duration = Duration::from_secs(15);

/// Per-tenant live feed. Primary path subscribes to the
/// outbound event fabric; fallback path polls the recent-logs ring.
pub struct LiveFanout {
    nats: Option<async_nats::Client>,
    cache: Arc<AuditCache>,
    service: Arc<AuditService>,
}

impl LiveFanout {
    pub fn new(nats: Option<async_nats::Client>, cache: Arc<AuditCache>, service: Arc<AuditService>) -> Arc<Self> {
        Arc::new(Self { nats, cache, service })
    }

    /// Builds the SSE frame stream for one connected client of `tenant`.
    pub fn stream(self: &Arc<Self>, tenant: String) -> impl Stream<Item = Result<Event, Infallible>> {
        let (tx, rx) = mpsc::channel(QUEUE_CAP);
        let fanout = self.clone();
        tokio::spawn(async move {
            fanout.run(tenant, tx).await;
        });
        ReceiverStream::new(rx).map(Ok)
    }

    async fn run(&self, tenant: String, tx: mpsc::Sender<Event>) {
        let initial = self
            .service
            .recent_logs(&tenant, INITIAL_BATCH)
            .await
            .unwrap_or_default();
        let initial_frame = serde_json::json!({"type": "initial", "logs": initial});
        if tx.send(Event::default().data(initial_frame.to_string())).await.is_err() {
            return;
        }
        let connected = serde_json::json!({"type": "connected"});
        if tx.send(Event::default().data(connected.to_string())).await.is_err() {
            return;
        }

        match &self.nats {
            Some(client) => self.run_primary(client, &tenant, tx).await,
            None => self.run_fallback(&tenant, tx).await,
        }
    }

    async fn run_primary(&self, client: &async_nats::Client, tenant: &str, tx: mpsc::Sender<Event>) {
        let subject = format!("audit.{tenant}.>");
        let mut sub = match client.subscribe(subject).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(tenant, "failed to subscribe to live event fabric, falling back to polling: {e}");
                return self.run_fallback(tenant, tx).await;
            }
        };

        loop {
            tokio::select! {
                _ = tx.closed() => {
                    return;
                }
                _ = tokio::time::sleep(HEARTBEAT_IDLE) => {
                    if tx.send(Event::default().comment("heartbeat")).await.is_err() {
                        return;
                    }
                }
                message = sub.next() => {
                    let Some(message) = message else { return };
                    let frame = translate_message(&message);
                    match tx.try_send(frame) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!(tenant, "live subscription queue full, dropping event");
                        }
                        Err(TrySendError::Closed(_)) => return,
                    }
                }
            }
        }
    }

    async fn run_fallback(&self, tenant: &str, tx: mpsc::Sender<Event>) {
        let mut last_seen = Utc::now();
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            match self.cache.recent_since(tenant, last_seen) {
                Ok(records) if !records.is_empty() => {
                    if let Some(latest) = records.iter().map(|r| r.occurred_at).max() {
                        last_seen = latest;
                    }
                    let frame = serde_json::json!({"type": "update", "logs": records});
                    if tx.send(Event::default().data(frame.to_string())).await.is_err() {
                        return;
                    }
                }
                Ok(_) => {
                    if tx.send(Event::default().comment("heartbeat")).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!(tenant, "fallback poll of recent logs failed: {e}"),
            }
        }
    }
}

fn translate_message(message: &async_nats::Message) -> Event {
    Event::default().data(update_frame_json(&message.payload))
}

/// Extracts the `log` field from a published `{type, tenant_id, log}` body
/// and wraps it as an `update` frame.
fn update_frame_json(payload: &[u8]) -> String {
    let body: serde_json::Value = serde_json::from_slice(payload).unwrap_or(serde_json::Value::Null);
    let log = body.get("log").cloned().unwrap_or(serde_json::Value::Null);
    serde_json::json!({"type": "update", "logs": [log]}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_frame_wraps_log_field() {
        let payload = serde_json::json!({"type": "created", "tenant_id": "t1", "log": {"id": "x"}})
            .to_string();
        let frame = update_frame_json(payload.as_bytes());
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "update");
        assert_eq!(parsed["logs"][0]["id"], "x");
    }

    #[test]
    fn update_frame_defaults_to_null_log_on_malformed_payload() {
        let frame = update_frame_json(b"not json");
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["logs"][0], serde_json::Value::Null);
    }
}
