//! Caller identity: role claims issued elsewhere and the actor recorded in audit entries.
//!
//! The ledger does not issue or verify credentials. It receives [`Claims`]
//! already authenticated by the session layer and only checks the role.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::store::AccountId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

/// Authenticated caller identity with its role claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub subject: AccountId,
    pub roles: Vec<Role>,
}

impl Claims {
    pub fn user(subject: impl Into<AccountId>) -> Self {
        Self {
            subject: subject.into(),
            roles: vec![Role::User],
        }
    }

    pub fn admin(subject: impl Into<AccountId>) -> Self {
        Self {
            subject: subject.into(),
            roles: vec![Role::User, Role::Admin],
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Gate for adjudication entry points. Returns the actor to record.
    pub fn require_admin(&self) -> Result<Actor> {
        if !self.has_role(Role::Admin) {
            tracing::warn!(
                subject = %self.subject,
                "Rejected adjudication attempt without admin claim"
            );
            return Err(LedgerError::Unauthorized(format!(
                "{} lacks the admin role",
                self.subject
            )));
        }
        Ok(Actor::Account(self.subject.clone()))
    }
}

/// Who performed a mutation.
///
/// Scheduled jobs and externally triggered signals act as [`Actor::System`]
/// rather than leaving the actor empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Account(AccountId),
    System,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Account(id) => write!(f, "{id}"),
            Self::System => f.write_str("system"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_claim_passes() {
        let claims = Claims::admin("ops-1");
        assert_eq!(
            claims.require_admin().unwrap(),
            Actor::Account(AccountId::from("ops-1"))
        );
    }

    #[test]
    fn test_user_claim_rejected() {
        let err = Claims::user("alice").require_admin().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unauthorized);
    }

    #[test]
    fn test_empty_roles_rejected() {
        let claims = Claims {
            subject: "nobody".into(),
            roles: vec![],
        };
        assert!(claims.require_admin().is_err());
    }

    #[test]
    fn test_actor_serde() {
        let json = serde_json::to_string(&Actor::System).unwrap();
        assert_eq!(json, "\"system\"");
        let json = serde_json::to_string(&Actor::Account("bob".into())).unwrap();
        assert_eq!(json, r#"{"account":"bob"}"#);
    }
}
