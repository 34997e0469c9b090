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

/// Audited verb, drawn from a closed vocabulary spanning authentication,
/// CRUD, workflow, RBAC, config and export/import concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    // authentication verbs
    Login,
    Logout,
    LoginFailed,
    // CRUD verbs
    Create,
    Read,
    Update,
    Delete,
    BulkUpdate,
    BulkDelete,
    // workflow verbs
    Approve,
    Reject,
    Submit,
    Cancel,
    // RBAC verbs
    Grant,
    Revoke,
    RoleChange,
    // config verbs
    Configure,
    // export/import
    Export,
    Import,
    // fallback
    Other,
}

impl Action {
    /// `auth-verbs`, as used by `get-failed-auth`.
    pub fn is_auth_verb(&self) -> bool {
        matches!(self, Action::Login | Action::Logout | Action::LoginFailed)
    }

    /// Destructive verbs considered for `get-suspicious` rule (a).
    pub fn is_destructive(&self) -> bool {
        matches!(self, Action::Delete | Action::BulkDelete)
    }

    /// RBAC-category verbs; any of these makes a record alertable.
    pub fn is_rbac_verb(&self) -> bool {
        matches!(self, Action::Grant | Action::Revoke | Action::RoleChange)
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Login => "LOGIN",
            Action::Logout => "LOGOUT",
            Action::LoginFailed => "LOGIN_FAILED",
            Action::Create => "CREATE",
            Action::Read => "READ",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
            Action::BulkUpdate => "BULK_UPDATE",
            Action::BulkDelete => "BULK_DELETE",
            Action::Approve => "APPROVE",
            Action::Reject => "REJECT",
            Action::Submit => "SUBMIT",
            Action::Cancel => "CANCEL",
            Action::Grant => "GRANT",
            Action::Revoke => "REVOKE",
            Action::RoleChange => "ROLE_CHANGE",
            Action::Configure => "CONFIGURE",
            Action::Export => "EXPORT",
            Action::Import => "IMPORT",
            Action::Other => "OTHER",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOGIN" => Ok(Action::Login),
            "LOGOUT" => Ok(Action::Logout),
            "LOGIN_FAILED" => Ok(Action::LoginFailed),
            "CREATE" => Ok(Action::Create),
            "READ" => Ok(Action::Read),
            "UPDATE" => Ok(Action::Update),
            "DELETE" => Ok(Action::Delete),
            "BULK_UPDATE" => Ok(Action::BulkUpdate),
            "BULK_DELETE" => Ok(Action::BulkDelete),
            "APPROVE" => Ok(Action::Approve),
            "REJECT" => Ok(Action::Reject),
            "SUBMIT" => Ok(Action::Submit),
            "CANCEL" => Ok(Action::Cancel),
            "GRANT" => Ok(Action::Grant),
            "REVOKE" => Ok(Action::Revoke),
            "ROLE_CHANGE" => Ok(Action::RoleChange),
            "CONFIGURE" => Ok(Action::Configure),
            "EXPORT" => Ok(Action::Export),
            "IMPORT" => Ok(Action::Import),
            "OTHER" => Ok(Action::Other),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_verbs_are_flagged() {
        assert!(Action::Login.is_auth_verb());
        assert!(Action::LoginFailed.is_auth_verb());
        assert!(!Action::Create.is_auth_verb());
    }

    #[test]
    fn destructive_verbs_include_bulk_delete() {
        assert!(Action::Delete.is_destructive());
        assert!(Action::BulkDelete.is_destructive());
        assert!(!Action::Update.is_destructive());
    }

    #[test]
    fn unrecognized_action_falls_back_to_error_not_other() {
        assert!(Action::from_str("FROB").is_err());
    }

    #[test]
    fn rbac_verbs_are_flagged() {
        assert!(Action::Grant.is_rbac_verb());
        assert!(Action::Revoke.is_rbac_verb());
        assert!(Action::RoleChange.is_rbac_verb());
        assert!(!Action::Update.is_rbac_verb());
    }
}
