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

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// Audited noun, drawn from a closed vocabulary, one variant per
/// domain stream consumed by [`crate::ingestion`] plus the platform-level
/// nouns (user/role/permission/auth/tenant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Resource {
    User,
    Role,
    Permission,
    Auth,
    Tenant,
    Staff,
    Order,
    Payment,
    Customer,
    Inventory,
    Product,
    Return,
    Review,
    Coupon,
    Vendor,
    GiftCard,
    Ticket,
    Approval,
    Category,
    Shipping,
    Other,
}

impl Resource {
    /// Sensitive classes for `get-suspicious` rule (c), `EXPORT` on these.
    pub fn is_sensitive_for_export(&self) -> bool {
        matches!(self, Resource::Customer | Resource::Order | Resource::Payment)
    }
}

impl Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Resource::User => "USER",
            Resource::Role => "ROLE",
            Resource::Permission => "PERMISSION",
            Resource::Auth => "AUTH",
            Resource::Tenant => "TENANT",
            Resource::Staff => "STAFF",
            Resource::Order => "ORDER",
            Resource::Payment => "PAYMENT",
            Resource::Customer => "CUSTOMER",
            Resource::Inventory => "INVENTORY",
            Resource::Product => "PRODUCT",
            Resource::Return => "RETURN",
            Resource::Review => "REVIEW",
            Resource::Coupon => "COUPON",
            Resource::Vendor => "VENDOR",
            Resource::GiftCard => "GIFT_CARD",
            Resource::Ticket => "TICKET",
            Resource::Approval => "APPROVAL",
            Resource::Category => "CATEGORY",
            Resource::Shipping => "SHIPPING",
            Resource::Other => "OTHER",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Resource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USER" => Ok(Resource::User),
            "ROLE" => Ok(Resource::Role),
            "PERMISSION" => Ok(Resource::Permission),
            "AUTH" => Ok(Resource::Auth),
            "TENANT" => Ok(Resource::Tenant),
            "STAFF" => Ok(Resource::Staff),
            "ORDER" => Ok(Resource::Order),
            "PAYMENT" => Ok(Resource::Payment),
            "CUSTOMER" => Ok(Resource::Customer),
            "INVENTORY" => Ok(Resource::Inventory),
            "PRODUCT" => Ok(Resource::Product),
            "RETURN" => Ok(Resource::Return),
            "REVIEW" => Ok(Resource::Review),
            "COUPON" => Ok(Resource::Coupon),
            "VENDOR" => Ok(Resource::Vendor),
            "GIFT_CARD" => Ok(Resource::GiftCard),
            "TICKET" => Ok(Resource::Ticket),
            "APPROVAL" => Ok(Resource::Approval),
            "CATEGORY" => Ok(Resource::Category),
            "SHIPPING" => Ok(Resource::Shipping),
            "OTHER" => Ok(Resource::Other),
            other => Err(format!("unknown resource: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_classes_cover_export_rule() {
        assert!(Resource::Customer.is_sensitive_for_export());
        assert!(Resource::Order.is_sensitive_for_export());
        assert!(Resource::Payment.is_sensitive_for_export());
        assert!(!Resource::Product.is_sensitive_for_export());
    }

    #[test]
    fn round_trips_through_display_and_from_str() {
        for r in [Resource::GiftCard, Resource::Ticket, Resource::Shipping] {
            assert_eq!(Resource::from_str(&r.to_string()).unwrap(), r);
        }
    }
}
