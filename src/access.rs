//! Role registry shared by every component.
//!
//! One capability object answers "does this account hold this role"; components
//! hold it behind an `Arc` instead of mixing access control into themselves.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::error::AccessError;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::record::{Identity, Role};

#[derive(Debug, Default)]
pub struct AccessRegistry {
    roles: RwLock<HashMap<Role, HashSet<Identity>>>,
}

impl AccessRegistry {
    /// Registry with `admin` holding the ADMIN role.
    pub fn new(admin: Identity) -> Self {
        let registry = Self::default();
        if let Ok(mut roles) = registry.roles.write() {
            roles.entry(Role::admin()).or_default().insert(admin);
        }
        registry
    }

    pub fn has_role(&self, role: &Role, account: &Identity) -> bool {
        self.roles
            .read()
            .map(|roles| roles.get(role).is_some_and(|members| members.contains(account)))
            .unwrap_or(false)
    }

    pub fn has_any_role(&self, roles: &[Role], account: &Identity) -> bool {
        roles.iter().any(|r| self.has_role(r, account))
    }

    pub fn require(&self, role: &Role, account: &Identity) -> Result<(), AccessError> {
        if self.has_role(role, account) {
            Ok(())
        } else {
            Err(AccessError::Unauthorized {
                account: account.clone(),
                role: role.clone(),
            })
        }
    }

    pub fn grant(
        &self,
        caller: &Identity,
        role: Role,
        account: Identity,
    ) -> Result<(), AccessError> {
        self.require(&Role::admin(), caller)?;
        log(
            Level::Info,
            Domain::Access,
            "role_granted",
            obj(&[
                ("caller", v_str(caller.as_str())),
                ("role", v_str(&role.0)),
                ("account", v_str(account.as_str())),
            ]),
        );
        if let Ok(mut roles) = self.roles.write() {
            roles.entry(role).or_default().insert(account);
        }
        Ok(())
    }

    pub fn revoke(
        &self,
        caller: &Identity,
        role: &Role,
        account: &Identity,
    ) -> Result<(), AccessError> {
        self.require(&Role::admin(), caller)?;
        if let Ok(mut roles) = self.roles.write() {
            if let Some(members) = roles.get_mut(role) {
                members.remove(account);
            }
        }
        log(
            Level::Info,
            Domain::Access,
            "role_revoked",
            obj(&[
                ("caller", v_str(caller.as_str())),
                ("role", v_str(&role.0)),
                ("account", v_str(account.as_str())),
            ]),
        );
        Ok(())
    }

    pub fn members(&self, role: &Role) -> usize {
        self.roles
            .read()
            .map(|roles| roles.get(role).map_or(0, |m| m.len()))
            .unwrap_or(0)
    }
}
