use anyhow::Result;
use std::str::FromStr;

use super::{AppContext, Command};
use simpa_bend::Role;

/// Open the database, running migrations on the way.
pub struct InitDbCommand<'a> {
    ctx: &'a AppContext,
}

impl<'a> InitDbCommand<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }
}

impl Command for InitDbCommand<'_> {
    async fn execute(&self) -> Result<()> {
        println!("🗄️  Database ready at {}", self.ctx.config.database.url);
        let holders = self.ctx.engine.roles().holders(Role::Superadmin).await?;
        if holders.is_empty() {
            println!("   💡 No superadmin yet. Run: simpa-bend bootstrap-admin <USER>");
        }
        Ok(())
    }
}

pub struct BootstrapAdminCommand<'a> {
    ctx: &'a AppContext,
    user_id: String,
}

impl<'a> BootstrapAdminCommand<'a> {
    pub fn new(ctx: &'a AppContext, user_id: String) -> Self {
        Self { ctx, user_id }
    }
}

impl Command for BootstrapAdminCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let assignment = self.ctx.engine.roles().bootstrap_superadmin(&self.user_id).await?;
        println!("👑 {} is now {}", assignment.user_id, assignment.role.label());
        Ok(())
    }
}

pub struct AssignRoleCommand<'a> {
    ctx: &'a AppContext,
    user_id: String,
    role: String,
    opd: Option<String>,
}

impl<'a> AssignRoleCommand<'a> {
    pub fn new(ctx: &'a AppContext, user_id: String, role: String) -> Self {
        Self {
            ctx,
            user_id,
            role,
            opd: None,
        }
    }

    pub fn with_opd(mut self, opd: Option<String>) -> Self {
        self.opd = opd;
        self
    }
}

impl Command for AssignRoleCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let role = Role::from_str(&self.role)?;
        let actor = self.ctx.actor().await?;
        let assignment = self
            .ctx
            .engine
            .roles()
            .assign(&actor, &self.user_id, role, self.opd.clone())
            .await?;
        match &assignment.opd_id {
            Some(opd) => println!("✅ {} granted {} for OPD {opd}", assignment.user_id, role.label()),
            None => println!("✅ {} granted {}", assignment.user_id, role.label()),
        }
        Ok(())
    }
}

pub struct RevokeRoleCommand<'a> {
    ctx: &'a AppContext,
    user_id: String,
    role: String,
}

impl<'a> RevokeRoleCommand<'a> {
    pub fn new(ctx: &'a AppContext, user_id: String, role: String) -> Self {
        Self { ctx, user_id, role }
    }
}

impl Command for RevokeRoleCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let role = Role::from_str(&self.role)?;
        let actor = self.ctx.actor().await?;
        self.ctx.engine.roles().revoke(&actor, &self.user_id, role).await?;
        println!("🚫 {} no longer holds {}", self.user_id, role.label());
        Ok(())
    }
}

pub struct EmergencyCommand<'a> {
    ctx: &'a AppContext,
    mode: String,
    reason: Option<String>,
}

impl<'a> EmergencyCommand<'a> {
    pub fn new(ctx: &'a AppContext, mode: String) -> Self {
        Self {
            ctx,
            mode,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }
}

impl Command for EmergencyCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let gate = self.ctx.engine.otp_gate();
        if self.mode == "status" {
            let state = gate.emergency_state().await?;
            if state.active {
                println!("🚨 Emergency mode is ON");
            } else {
                println!("🟢 Emergency mode is off");
            }
            if let (Some(by), Some(at)) = (&state.changed_by, state.changed_at) {
                println!("   Last changed by {by} at {}", at.format("%Y-%m-%d %H:%M UTC"));
            }
            if let Some(reason) = &state.reason {
                println!("   Reason: {reason}");
            }
            for entry in gate.emergency_history().await?.iter().rev().take(5) {
                let verb = if entry.activated { "on " } else { "off" };
                println!("   {} {verb} by {}: {}", entry.at.format("%Y-%m-%d %H:%M"), entry.actor, entry.reason);
            }
            return Ok(());
        }

        let active = self.mode == "on";
        let actor = self.ctx.actor().await?;
        let reason = self.reason.as_deref().unwrap_or_default();
        self.ctx.engine.set_emergency(&actor, active, reason).await?;
        if active {
            println!("🚨 Emergency mode ON: one-time codes are bypassed and every bypass is noted in the audit log");
        } else {
            println!("🟢 Emergency mode off: one-time codes are required again");
        }
        Ok(())
    }
}
