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

use crate::audit::model::NewAuditRecord;
use crate::audit::service::AuditService;
use crate::common::types::{Action, Outcome, Resource, Severity};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Domain streams with a durable consumer. Hyphenated to
/// match each domain's own event naming; normalized to `SCREAMING_SNAKE_CASE`
/// for NATS stream/consumer names.
const DOMAINS: &[&str] = &[
    "order", "payment", "customer", "auth", "inventory", "product", "return", "review", "coupon",
    "vendor", "gift-card", "ticket", "staff", "tenant", "approval", "category", "shipping",
];

fn normalized(domain: &str) -> String {
    domain.to_uppercase().replace('-', "_")
}

/// One durable pull consumer per domain stream, each run by an
/// independent worker so one stream's failures never stall the others.
pub struct DomainEventConsumer {
    jetstream: async_nats::jetstream::Context,
    service: Arc<AuditService>,
}

impl DomainEventConsumer {
    pub fn new(jetstream: async_nats::jetstream::Context, service: Arc<AuditService>) -> Arc<Self> {
        Arc::new(Self { jetstream, service })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut handles = Vec::with_capacity(DOMAINS.len());
        for domain in DOMAINS {
            let this = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                this.run_stream(domain, cancel).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn run_stream(&self, domain: &str, cancel: CancellationToken) {
        let stream_name = format!("{}_EVENTS", normalized(domain));
        let consumer_name = format!("audit-service-{}", normalized(domain));

        let stream = match self.jetstream.get_stream(&stream_name).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(domain, stream_name, "stream not available, skipping (non-fatal): {e}");
                return;
            }
        };

        let consumer = match stream
            .get_or_create_consumer(
                &consumer_name,
                async_nats::jetstream::consumer::pull::Config {
                    durable_name: Some(consumer_name.clone()),
                    deliver_policy: async_nats::jetstream::consumer::DeliverPolicy::New,
                    ack_policy: async_nats::jetstream::consumer::AckPolicy::Explicit,
                    filter_subject: format!("{domain}.>"),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!(domain, "failed to create durable consumer, skipping (non-fatal): {e}");
                return;
            }
        };

        info!(domain, consumer_name, "domain event consumer started");

        loop {
            if cancel.is_cancelled() {
                return;
            }
            let batch = match consumer
                .fetch()
                .max_messages(10)
                .expires(Duration::from_secs(5))
                .messages()
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(domain, "pull failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            tokio::pin!(batch);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = batch.next() => {
                        match next {
                            Some(Ok(message)) => self.handle_message(domain, message).await,
                            Some(Err(e)) => warn!(domain, "message pull error: {e}"),
                            None => break,
                        }
                    }
                }
            }
        }
    }

    async fn handle_message(&self, domain: &str, message: async_nats::jetstream::Message) {
        let value: Value = match serde_json::from_slice(&message.payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(domain, "malformed event payload, acking and dropping: {e}");
                let _ = message.ack().await;
                return;
            }
        };

        let Some(tenant_id) = value.get("tenantId").and_then(Value::as_str) else {
            warn!(domain, "event missing tenantId, acking and dropping");
            let _ = message.ack().await;
            return;
        };

        let event_type = value.get("eventType").and_then(Value::as_str).unwrap_or("unknown");
        let (action, resource, severity) = translate(event_type);

        let record = NewAuditRecord {
            user_id: extract_user_id(&value),
            action: Some(action),
            resource: Some(resource),
            resource_id: extract_resource_id(&value),
            resource_name: extract_resource_name(&value),
            outcome: Some(derive_outcome(&value)),
            severity: Some(severity),
            correlation_id: value
                .get("correlationId")
                .and_then(Value::as_str)
                .map(str::to_string),
            error_message: value.get("errorMessage").and_then(Value::as_str).map(str::to_string),
            error_code: value.get("errorCode").and_then(Value::as_str).map(str::to_string),
            description: Some(describe(event_type, &value)),
            metadata: Some(value.clone()),
            service_name: Some(domain.to_string()),
            occurred_at: value
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            ..Default::default()
        };

        match self.service.create(tenant_id, record).await {
            Ok(_) => {
                let _ = message.ack().await;
            }
            Err(e) => {
                warn!(domain, tenant_id, "failed to persist ingested event, nacking for redelivery: {e}");
                let _ = message
                    .ack_with(async_nats::jetstream::AckKind::Nak(None))
                    .await;
            }
        }
    }
}

fn extract_user_id(value: &Value) -> Option<String> {
    for key in ["userId", "customerId", "staffId"] {
        if let Some(id) = value.get(key).and_then(Value::as_str) {
            return Some(id.to_string());
        }
    }
    None
}

fn extract_resource_id(value: &Value) -> Option<String> {
    for key in [
        "resourceId", "id", "orderId", "paymentId", "productId", "ticketId", "vendorId",
        "staffId", "couponId", "reviewId", "returnId", "shipmentId", "approvalId", "categoryId",
        "giftCardId", "customerId",
    ] {
        if let Some(id) = value.get(key).and_then(Value::as_str) {
            return Some(id.to_string());
        }
    }
    None
}

fn extract_resource_name(value: &Value) -> Option<String> {
    for key in ["name", "displayName", "title", "label"] {
        if let Some(name) = value.get(key).and_then(Value::as_str) {
            return Some(name.to_string());
        }
    }
    None
}

/// `outcome = FAILURE` whenever any of these three fields is present,
/// regardless of their value.
fn derive_outcome(value: &Value) -> Outcome {
    if value.get("status").is_some() || value.get("errorCode").is_some() || value.get("errorMessage").is_some() {
        Outcome::Failure
    } else {
        Outcome::Success
    }
}

/// Declarative event → audit translation table. Every event
/// type the source enumerates is reproduced here; unknown types fall back
/// to `(OTHER, OTHER, LOW)`.
fn translate(event_type: &str) -> (Action, Resource, Severity) {
    use Action::*;
    use Resource::*;
    use Severity::*;
    match event_type {
        "order.created" => (Create, Order, Low),
        "order.updated" => (Update, Order, Low),
        "order.cancelled" => (Delete, Order, Medium),
        "order.refunded" => (Update, Order, High),
        "order.shipped" => (Update, Order, Low),

        "payment.created" => (Create, Payment, Low),
        "payment.succeeded" => (Update, Payment, Low),
        "payment.failed" => (Update, Payment, High),
        "payment.refunded" => (Update, Payment, High),
        "payment.chargeback" => (Update, Payment, Critical),

        "customer.created" => (Create, Customer, Low),
        "customer.updated" => (Update, Customer, Low),
        "customer.deleted" => (Delete, Customer, Medium),
        "customer.merged" => (Update, Customer, Medium),

        "auth.login" => (Login, Auth, Low),
        "auth.logout" => (Logout, Auth, Low),
        "auth.login_failed" => (Login, Auth, High),
        "auth.account_locked" => (Update, Auth, Critical),
        "auth.password_reset" => (Update, Auth, Medium),
        "auth.mfa_enabled" => (Update, Auth, Low),

        "inventory.adjusted" => (Update, Inventory, Medium),
        "inventory.low_stock" => (Read, Inventory, Medium),
        "inventory.received" => (Create, Inventory, Low),

        "product.created" => (Create, Product, Low),
        "product.updated" => (Update, Product, Low),
        "product.deleted" => (Delete, Product, Medium),
        "product.price_changed" => (Update, Product, Medium),

        "return.requested" => (Create, Return, Low),
        "return.approved" => (Approve, Return, Low),
        "return.rejected" => (Reject, Return, Medium),
        "return.completed" => (Update, Return, Low),

        "review.created" => (Create, Review, Low),
        "review.flagged" => (Update, Review, Medium),
        "review.deleted" => (Delete, Review, Medium),

        "coupon.created" => (Create, Coupon, Low),
        "coupon.redeemed" => (Update, Coupon, Low),
        "coupon.revoked" => (Revoke, Coupon, Medium),

        "vendor.created" => (Create, Vendor, Low),
        "vendor.updated" => (Update, Vendor, Low),
        "vendor.suspended" => (Update, Vendor, High),

        "gift_card.issued" | "gift-card.issued" => (Create, GiftCard, Low),
        "gift_card.redeemed" | "gift-card.redeemed" => (Update, GiftCard, Low),
        "gift_card.expired" | "gift-card.expired" => (Update, GiftCard, Low),

        "ticket.created" => (Create, Ticket, Low),
        "ticket.escalated" => (Update, Ticket, Medium),
        "ticket.closed" => (Update, Ticket, Low),

        "staff.created" => (Create, Staff, Low),
        "staff.role_changed" => (Update, Staff, High),
        "staff.terminated" => (Delete, Staff, High),

        "tenant.activated" => (Update, Tenant, Medium),
        "tenant.deactivated" => (Update, Tenant, Critical),
        "tenant.plan_changed" => (Update, Tenant, Medium),

        "approval.requested" => (Create, Approval, Low),
        "approval.granted" => (Approve, Approval, Low),
        "approval.denied" => (Reject, Approval, Medium),

        "category.created" => (Create, Category, Low),
        "category.updated" => (Update, Category, Low),
        "category.deleted" => (Delete, Category, Medium),

        "shipping.label_created" => (Create, Shipping, Low),
        "shipping.dispatched" => (Update, Shipping, Low),
        "shipping.delayed" => (Update, Shipping, Medium),
        "shipping.lost" => (Update, Shipping, High),

        _ => (Other, Other, Low),
    }
}

/// Per-event-type description template, with a generic fallback.
fn describe(event_type: &str, value: &Value) -> String {
    let error_message = value.get("errorMessage").and_then(Value::as_str);
    match event_type {
        "payment.failed" => format!("Payment failed: {}", error_message.unwrap_or("unknown reason")),
        "payment.chargeback" => "Payment charged back by issuer".to_string(),
        "order.cancelled" => "Order cancelled".to_string(),
        "order.refunded" => "Order refunded".to_string(),
        "auth.login_failed" => format!(
            "Login failed: {}",
            error_message.unwrap_or("invalid credentials")
        ),
        "auth.account_locked" => "Account locked after repeated failed logins".to_string(),
        "tenant.deactivated" => "Tenant deactivated".to_string(),
        "staff.role_changed" => "Staff member's role was changed".to_string(),
        "customer.deleted" => "Customer record deleted".to_string(),
        "vendor.suspended" => "Vendor suspended".to_string(),
        other => {
            let (domain, verb) = other.split_once('.').unwrap_or((other, ""));
            if verb.is_empty() {
                format!("{domain} event")
            } else {
                format!("{domain} {verb}", domain = domain, verb = verb.replace('_', " "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn translates_documented_sample_table() {
        assert_eq!(translate("order.created"), (Action::Create, Resource::Order, Severity::Low));
        assert_eq!(translate("order.cancelled"), (Action::Delete, Resource::Order, Severity::Medium));
        assert_eq!(translate("order.refunded"), (Action::Update, Resource::Order, Severity::High));
        assert_eq!(translate("payment.failed"), (Action::Update, Resource::Payment, Severity::High));
        assert_eq!(translate("auth.login_failed"), (Action::Login, Resource::Auth, Severity::High));
        assert_eq!(translate("auth.account_locked"), (Action::Update, Resource::Auth, Severity::Critical));
        assert_eq!(translate("tenant.deactivated"), (Action::Update, Resource::Tenant, Severity::Critical));
        assert_eq!(translate("staff.role_changed"), (Action::Update, Resource::Staff, Severity::High));
    }

    #[test]
    fn unknown_event_type_falls_back_to_other() {
        assert_eq!(translate("frobnicate.zorp"), (Action::Other, Resource::Other, Severity::Low));
    }

    #[test]
    fn user_id_priority_is_user_then_customer_then_staff() {
        let v = json!({"customerId": "c1", "staffId": "s1"});
        assert_eq!(extract_user_id(&v), Some("c1".to_string()));
        let v = json!({"staffId": "s1"});
        assert_eq!(extract_user_id(&v), Some("s1".to_string()));
        let v = json!({"userId": "u1", "customerId": "c1"});
        assert_eq!(extract_user_id(&v), Some("u1".to_string()));
    }

    #[test]
    fn payment_failed_description_matches_end_to_end_scenario() {
        let v = json!({"eventType": "payment.failed", "tenantId": "t1", "errorMessage": "declined"});
        assert_eq!(describe("payment.failed", &v), "Payment failed: declined");
        assert_eq!(derive_outcome(&v), Outcome::Failure);
    }

    #[test]
    fn absence_of_status_and_error_fields_yields_success() {
        let v = json!({"eventType": "order.created", "tenantId": "t1"});
        assert_eq!(derive_outcome(&v), Outcome::Success);
    }
}
