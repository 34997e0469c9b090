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

use crate::common::types::value_object::{ValueObject, ValueObjectable};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

/// A tenant identifier, validated as a 36-character canonical UUID before
/// it is allowed anywhere near routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TenantId(pub String);

impl ValueObjectable for TenantId {
    type DataType = String;

    fn validate(&self) -> Result<(), String> {
        if self.0.len() != 36 {
            return Err("invalid tenant id".to_string());
        }
        Uuid::parse_str(&self.0).map_err(|_| "invalid tenant id".to_string())?;
        Ok(())
    }

    fn get_value(&self) -> &Self::DataType {
        &self.0
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for ValueObject<TenantId> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ValueObject::new(TenantId(s)).map_err(serde::de::Error::custom)
    }
}

impl TryFrom<&str> for ValueObject<TenantId> {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        ValueObject::new(TenantId(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_canonical_uuid() {
        let id = Uuid::new_v4().to_string();
        assert!(ValueObject::new(TenantId(id)).is_ok());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(ValueObject::new(TenantId("not-a-uuid".to_string())).is_err());
    }

    #[test]
    fn rejects_malformed_uuid_of_right_length() {
        let bogus = "zzzzzzzz-zzzz-zzzz-zzzz-zzzzzzzzzzzz";
        assert_eq!(bogus.len(), 36);
        assert!(ValueObject::new(TenantId(bogus.to_string())).is_err());
    }
}
