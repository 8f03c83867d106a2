//! Access coordinator: the one place modules ask "may I act" and the one
//! place halts are requested from.
//!
//! Sector switches and the global halt are independent. A frozen sector does
//! not halt the protocol, and a halt does not touch sector flags.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::access::AccessRegistry;
use crate::error::AccessError;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::record::{ChainCursor, Identity, Role, SectorId, Severity};
use crate::reliability::{GateState, GuardianGate};
use crate::reporter::{Report, Reporter};
use serde_json::json;

pub struct AccessCoordinator {
    registry: Arc<AccessRegistry>,
    gate: Arc<GuardianGate>,
    sectors: RwLock<HashMap<SectorId, bool>>,
    role_sectors: RwLock<HashMap<Role, SectorId>>,
    reporter: Reporter,
    chain: Arc<ChainCursor>,
}

impl AccessCoordinator {
    pub fn new(
        registry: Arc<AccessRegistry>,
        gate: Arc<GuardianGate>,
        reporter: Reporter,
        chain: Arc<ChainCursor>,
    ) -> Self {
        Self {
            registry,
            gate,
            sectors: RwLock::new(HashMap::new()),
            role_sectors: RwLock::new(HashMap::new()),
            reporter,
            chain,
        }
    }

    pub fn registry(&self) -> &Arc<AccessRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &Arc<GuardianGate> {
        &self.gate
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Read path for every privileged module before it mutates state.
    pub fn is_operation_allowed(&self, role: &Role, account: &Identity) -> bool {
        if self.gate.is_halted() || !self.registry.has_role(role, account) {
            return false;
        }
        match self.sector_of(role) {
            Some(sector) => self.is_sector_active(&sector),
            None => true,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.gate.is_halted()
    }

    pub fn state(&self) -> GateState {
        self.gate.state()
    }

    /// Sectors never switched off are active.
    pub fn is_sector_active(&self, sector: &SectorId) -> bool {
        self.sectors
            .read()
            .map(|s| s.get(sector).copied().unwrap_or(true))
            .unwrap_or(false)
    }

    pub fn sector_of(&self, role: &Role) -> Option<SectorId> {
        self.role_sectors
            .read()
            .ok()
            .and_then(|m| m.get(role).cloned())
    }

    /// Tie a module role to the sector whose switch governs it.
    pub fn bind_role_sector(
        &self,
        caller: &Identity,
        role: Role,
        sector: SectorId,
    ) -> Result<(), AccessError> {
        self.registry.require(&Role::admin(), caller)?;
        log(
            Level::Info,
            Domain::Access,
            "role_sector_bound",
            obj(&[("role", v_str(&role.0)), ("sector", v_str(&sector.0))]),
        );
        if let Ok(mut m) = self.role_sectors.write() {
            m.insert(role, sector);
        }
        Ok(())
    }

    pub fn set_sector_status(
        &self,
        caller: &Identity,
        sector: SectorId,
        active: bool,
    ) -> Result<(), AccessError> {
        self.registry.require(&Role::admin(), caller)?;
        if let Ok(mut s) = self.sectors.write() {
            s.insert(sector.clone(), active);
        }
        log(
            Level::Warn,
            Domain::Access,
            "sector_status",
            obj(&[
                ("caller", v_str(caller.as_str())),
                ("sector", v_str(&sector.0)),
                ("active", json!(active)),
            ]),
        );
        let ctx = self.chain.context_for(caller);
        let report = if active {
            Report::new(Severity::Info, "sector", format!("sector {} reactivated", sector)).risk(10)
        } else {
            Report::new(Severity::Critical, "sector", format!("sector {} frozen", sector)).risk(80)
        };
        self.reporter.report(&ctx, report);
        Ok(())
    }

    pub fn trigger_global_lockdown(&self, caller: &Identity) -> Result<(), AccessError> {
        self.registry.require(&Role::admin(), caller)?;
        self.gate.emergency_pause(caller, "global lockdown")?;
        Ok(())
    }

    /// Lifting a halt stays auditor-gated even for a lockdown an admin started.
    pub fn release_global_lockdown(&self, caller: &Identity) -> Result<(), AccessError> {
        self.gate.unhalt(caller)?;
        Ok(())
    }

    /// Forced-halt entry point for the invariant monitor and automated sentinels.
    pub fn trigger_emergency_pause(
        &self,
        caller: &Identity,
        reason: &str,
    ) -> Result<(), AccessError> {
        self.gate.emergency_pause(caller, reason)?;
        Ok(())
    }

    pub fn cast_guardian_vote(&self, guardian: &Identity) -> Result<u32, AccessError> {
        Ok(self.gate.cast_vote(guardian)?)
    }

    pub fn unhalt(&self, caller: &Identity) -> Result<(), AccessError> {
        self.gate.unhalt(caller)?;
        Ok(())
    }
}
