//! Records owned by collaborators outside the core: garages and their
//! mechanic roster, customer vehicles, and the service catalog. The core only
//! reads them.
use crate::types::{Amount, ServiceId};

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Garage {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub admin_id: String,
    #[n(3)]
    pub approved: bool,
    #[n(4)]
    pub removed: bool,
    #[n(5)]
    pub mechanics: Vec<GarageMechanic>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct GarageMechanic {
    #[n(0)]
    pub mechanic_id: String,
    #[n(1)]
    pub approved: bool,
    #[n(2)]
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Vehicle {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub owner_id: String,
    #[n(2)]
    pub make: String,
    #[n(3)]
    pub model: String,
    #[n(4)]
    pub plate: String,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct CatalogService {
    #[n(0)]
    pub id: ServiceId,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub price: Amount,
    #[n(3)]
    pub removed: bool,
}

impl Garage {
    pub fn new(id: impl Into<String>, name: impl Into<String>, admin_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            admin_id: admin_id.into(),
            approved: true,
            removed: false,
            mechanics: vec![],
        }
    }

    pub fn with_mechanic(mut self, mechanic_id: impl Into<String>) -> Self {
        self.mechanics.push(GarageMechanic {
            mechanic_id: mechanic_id.into(),
            approved: true,
            removed: false,
        });
        self
    }

    /// Accepts new requests only while approved and not removed.
    pub fn is_open(&self) -> bool {
        self.approved && !self.removed
    }

    pub fn active_mechanics(&self) -> impl Iterator<Item = &str> {
        self.mechanics
            .iter()
            .filter(|m| m.approved && !m.removed)
            .map(|m| m.mechanic_id.as_str())
    }

    pub fn has_active_mechanic(&self, mechanic_id: &str) -> bool {
        self.active_mechanics().any(|m| m == mechanic_id)
    }
}

impl CatalogService {
    pub fn new(id: ServiceId, name: impl Into<String>, price: Amount) -> Self {
        Self {
            id,
            name: name.into(),
            price,
            removed: false,
        }
    }
}
