//! Authenticated caller identity, as handed to the core by the token resolver.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Customer,
    Mechanic,
    GarageAdmin,
    SystemAdmin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
    pub fn customer(id: impl Into<String>) -> Self {
        Self::new(id, Role::Customer)
    }
    pub fn mechanic(id: impl Into<String>) -> Self {
        Self::new(id, Role::Mechanic)
    }
    pub fn garage_admin(id: impl Into<String>) -> Self {
        Self::new(id, Role::GarageAdmin)
    }
    pub fn system_admin(id: impl Into<String>) -> Self {
        Self::new(id, Role::SystemAdmin)
    }

    pub fn is(&self, role: Role) -> bool {
        self.role == role
    }
}
