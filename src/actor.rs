//! Actors and privilege tiers
//!
//! Privilege is checked explicitly before every state-machine transition;
//! nothing in the store layer trusts the caller.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Manager,
    Supervisor,
    FrontDesk,
    Bar,
    Kitchen,
    Store,
}

impl Role {
    /// Supervisor and above may approve or reject pending records.
    pub fn can_approve(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager | Role::Supervisor)
    }
    /// Admin and manager submissions skip the approval queue entirely.
    pub fn auto_approves(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }
}

#[derive(Debug, Clone)]
pub struct Actor {
    pub id: String,
    pub name: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: String, name: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            name: name.into(),
            role,
        }
    }
}
