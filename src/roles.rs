use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::errors::{WorkflowError, WorkflowResult};
use crate::storage::WorkflowStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Superadmin,
    Admin,
    /// Treasury officer of a spending unit (OPD); creates and submits SPMs.
    BendaharaOpd,
    Resepsionis,
    /// Regional budget unit reviewer.
    Pbmd,
    Akuntansi,
    Perbendaharaan,
    KepalaBkad,
}

impl Role {
    pub const ALL: [Role; 8] = [
        Role::Superadmin,
        Role::Admin,
        Role::BendaharaOpd,
        Role::Resepsionis,
        Role::Pbmd,
        Role::Akuntansi,
        Role::Perbendaharaan,
        Role::KepalaBkad,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Superadmin => "superadmin",
            Role::Admin => "admin",
            Role::BendaharaOpd => "bendahara_opd",
            Role::Resepsionis => "resepsionis",
            Role::Pbmd => "pbmd",
            Role::Akuntansi => "akuntansi",
            Role::Perbendaharaan => "perbendaharaan",
            Role::KepalaBkad => "kepala_bkad",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::Superadmin => "Super Administrator",
            Role::Admin => "Administrator",
            Role::BendaharaOpd => "Bendahara OPD",
            Role::Resepsionis => "Resepsionis",
            Role::Pbmd => "Verifikator PBMD",
            Role::Akuntansi => "Verifikator Akuntansi",
            Role::Perbendaharaan => "Verifikator Perbendaharaan",
            Role::KepalaBkad => "Kepala BKAD",
        }
    }

    /// Reviewer roles that may have at most one active holder system-wide.
    pub fn is_single_holder(&self) -> bool {
        matches!(
            self,
            Role::Resepsionis | Role::Pbmd | Role::Akuntansi | Role::Perbendaharaan | Role::KepalaBkad
        )
    }

    pub fn is_administrator(&self) -> bool {
        matches!(self, Role::Superadmin | Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s.trim())
            .ok_or_else(|| WorkflowError::validation("role", format!("unknown role `{s}`")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub id: Uuid,
    pub user_id: String,
    pub role: Role,
    /// Spending unit the assignment is bound to (treasury officers only).
    pub opd_id: Option<String>,
    pub active: bool,
    pub assigned_by: String,
    pub assigned_at: DateTime<Utc>,
}

impl RoleAssignment {
    pub fn new(
        user_id: impl Into<String>,
        role: Role,
        opd_id: Option<String>,
        assigned_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            role,
            opd_id,
            active: true,
            assigned_by: assigned_by.into(),
            assigned_at: Utc::now(),
        }
    }
}

/// An authenticated user together with their active role assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub assignments: Vec<RoleAssignment>,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, assignments: Vec<RoleAssignment>) -> Self {
        Self {
            user_id: user_id.into(),
            assignments,
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.assignments.iter().any(|a| a.active && a.role == role)
    }

    pub fn is_superadmin(&self) -> bool {
        self.has_role(Role::Superadmin)
    }

    pub fn is_administrator(&self) -> bool {
        self.assignments.iter().any(|a| a.active && a.role.is_administrator())
    }

    /// Holds `role` directly, or is an administrator.
    pub fn can_act_as(&self, role: Role) -> bool {
        self.has_role(role) || self.is_administrator()
    }

    /// Treasury officer of `opd_id`, or an administrator.
    pub fn can_submit_for(&self, opd_id: &str) -> bool {
        self.is_administrator()
            || self.assignments.iter().any(|a| {
                a.active && a.role == Role::BendaharaOpd && a.opd_id.as_deref() == Some(opd_id)
            })
    }

    pub fn roles(&self) -> Vec<Role> {
        self.assignments
            .iter()
            .filter(|a| a.active)
            .map(|a| a.role)
            .collect()
    }
}

/// Grants and revokes roles. The single-holder invariant is enforced by
/// the store at write time, never by a pre-check alone.
#[derive(Clone)]
pub struct RoleRegistry {
    store: Arc<dyn WorkflowStore>,
}

impl RoleRegistry {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    /// Resolve a user id into an actor with the roles currently granted.
    pub async fn actor(&self, user_id: &str) -> WorkflowResult<Actor> {
        let assignments = self.store.active_roles(user_id).await?;
        Ok(Actor::new(user_id, assignments))
    }

    pub async fn assign(
        &self,
        by: &Actor,
        user_id: &str,
        role: Role,
        opd_id: Option<String>,
    ) -> WorkflowResult<RoleAssignment> {
        if !by.is_administrator() {
            return Err(WorkflowError::unauthorized(format!(
                "user `{}` may not assign roles",
                by.user_id
            )));
        }
        if role.is_administrator() && !by.is_superadmin() {
            return Err(WorkflowError::unauthorized(
                "only a superadmin may grant administrator roles",
            ));
        }
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(WorkflowError::validation("user_id", "must not be empty"));
        }
        let opd_id = opd_id.map(|o| o.trim().to_string()).filter(|o| !o.is_empty());
        match (role, &opd_id) {
            (Role::BendaharaOpd, None) => {
                return Err(WorkflowError::validation(
                    "opd_id",
                    "a treasury officer must be bound to a spending unit",
                ))
            }
            (Role::BendaharaOpd, Some(_)) => {}
            (_, Some(_)) => {
                return Err(WorkflowError::validation(
                    "opd_id",
                    format!("role `{role}` is not bound to a spending unit"),
                ))
            }
            (_, None) => {}
        }

        let assignment = RoleAssignment::new(user_id, role, opd_id, by.user_id.clone());
        self.store.insert_role_assignment(&assignment).await?;
        info!(user = %assignment.user_id, role = %role, by = %by.user_id, "Role assigned");
        Ok(assignment)
    }

    pub async fn revoke(&self, by: &Actor, user_id: &str, role: Role) -> WorkflowResult<()> {
        if !by.is_administrator() || (role.is_administrator() && !by.is_superadmin()) {
            return Err(WorkflowError::unauthorized(format!(
                "user `{}` may not revoke role `{role}`",
                by.user_id
            )));
        }
        if !self.store.deactivate_role(user_id, role).await? {
            return Err(WorkflowError::validation(
                "role",
                format!("user `{user_id}` does not hold `{role}`"),
            ));
        }
        info!(user = %user_id, role = %role, by = %by.user_id, "Role revoked");
        Ok(())
    }

    /// Grant the first superadmin. Refused once any superadmin is active.
    pub async fn bootstrap_superadmin(&self, user_id: &str) -> WorkflowResult<RoleAssignment> {
        if !self.store.active_holders(Role::Superadmin).await?.is_empty() {
            return Err(WorkflowError::unauthorized(
                "a superadmin already exists; ask them to grant roles",
            ));
        }
        let assignment = RoleAssignment::new(user_id, Role::Superadmin, None, "bootstrap");
        self.store.insert_role_assignment(&assignment).await?;
        info!(user = %user_id, "Bootstrapped superadmin");
        Ok(assignment)
    }

    pub async fn holders(&self, role: Role) -> WorkflowResult<Vec<RoleAssignment>> {
        self.store.active_holders(role).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    async fn registry_with_superadmin() -> (RoleRegistry, Actor) {
        let registry = RoleRegistry::new(Arc::new(MemoryStore::new()));
        registry.bootstrap_superadmin("root").await.unwrap();
        let root = registry.actor("root").await.unwrap();
        (registry, root)
    }

    #[test]
    fn single_holder_roles_are_the_reviewers() {
        let singles: Vec<_> = Role::ALL.into_iter().filter(Role::is_single_holder).collect();
        assert_eq!(
            singles,
            vec![
                Role::Resepsionis,
                Role::Pbmd,
                Role::Akuntansi,
                Role::Perbendaharaan,
                Role::KepalaBkad
            ]
        );
    }

    #[test]
    fn role_names_round_trip_through_from_str() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("bupati".parse::<Role>().is_err());
    }

    #[tokio::test]
    async fn bootstrap_only_once() {
        let (registry, _) = registry_with_superadmin().await;
        let err = registry.bootstrap_superadmin("other").await.unwrap_err();
        assert!(matches!(err, WorkflowError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn treasury_officer_needs_an_opd() {
        let (registry, root) = registry_with_superadmin().await;
        let err = registry
            .assign(&root, "budi", Role::BendaharaOpd, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { ref field, .. } if field == "opd_id"));

        registry
            .assign(&root, "budi", Role::BendaharaOpd, Some("DINKES".to_string()))
            .await
            .unwrap();
        let budi = registry.actor("budi").await.unwrap();
        assert!(budi.can_submit_for("DINKES"));
        assert!(!budi.can_submit_for("DISDIK"));
    }

    #[tokio::test]
    async fn plain_admin_cannot_mint_admins() {
        let (registry, root) = registry_with_superadmin().await;
        registry.assign(&root, "ani", Role::Admin, None).await.unwrap();
        let ani = registry.actor("ani").await.unwrap();
        let err = registry.assign(&ani, "eko", Role::Admin, None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Unauthorized { .. }));
        registry.assign(&ani, "eko", Role::Akuntansi, None).await.unwrap();
    }

    #[tokio::test]
    async fn revoked_single_holder_role_can_be_reassigned() {
        let (registry, root) = registry_with_superadmin().await;
        registry.assign(&root, "sri", Role::KepalaBkad, None).await.unwrap();
        registry.revoke(&root, "sri", Role::KepalaBkad).await.unwrap();
        registry.assign(&root, "tono", Role::KepalaBkad, None).await.unwrap();

        let holders = registry.holders(Role::KepalaBkad).await.unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].user_id, "tono");
        assert!(!registry.actor("sri").await.unwrap().has_role(Role::KepalaBkad));
    }
}
