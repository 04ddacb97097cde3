//! Identity collaborator: resolves caller tokens to principals.
//!
//! Account management and verification live outside the core; the core trusts
//! whatever principal the provider returns and only checks role and activity.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RideError};
use crate::ride::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Requester,
    Driver,
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub role: Role,
    pub is_active: bool,
    pub is_verified: bool,
}

impl Principal {
    pub fn requester(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::Requester,
            is_active: true,
            is_verified: true,
        }
    }

    pub fn driver(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::Driver,
            is_active: true,
            is_verified: true,
        }
    }

    /// Rejects inactive principals.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active {
            Ok(())
        } else {
            Err(RideError::unauthorized(format!(
                "account {} is inactive",
                self.user_id
            )))
        }
    }

    /// Rejects principals without `role`, or inactive ones.
    pub fn ensure_role(&self, role: Role) -> Result<()> {
        self.ensure_active()?;
        if self.role == role {
            Ok(())
        } else {
            Err(RideError::unauthorized(format!(
                "{:?} role required",
                role
            )))
        }
    }
}

/// Resolves an opaque caller token.
pub trait IdentityProvider: Send + Sync {
    /// Returns `None` for unknown or invalid tokens.
    fn resolve(&self, token: &str) -> Option<Principal>;

    /// Resolves and requires an active principal.
    fn authenticate(&self, token: &str) -> Result<Principal> {
        let principal = self
            .resolve(token)
            .ok_or_else(|| RideError::unauthorized("invalid credential"))?;
        principal.ensure_active()?;
        Ok(principal)
    }
}

/// Token table kept in memory; used by tests and the demo runner.
#[derive(Debug, Default)]
pub struct StaticIdentityProvider {
    tokens: RwLock<HashMap<String, Principal>>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, principal: Principal) {
        let mut tokens = self
            .tokens
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tokens.insert(token.into(), principal);
    }

    pub fn revoke(&self, token: &str) {
        let mut tokens = self
            .tokens
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tokens.remove(token);
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn resolve(&self, token: &str) -> Option<Principal> {
        let tokens = self
            .tokens
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tokens.get(token).cloned()
    }
}
