// libs/directory-cell/src/models.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ==============================================================================
// DIRECTORY MODELS (READ-ONLY COLLABORATORS)
// ==============================================================================

/// A clinic location. `capacity_consultorios` is the number of physical
/// treatment rooms available for concurrent use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clinic {
    pub id: Uuid,
    pub name: String,
    pub district_id: Uuid,
    pub capacity_consultorios: u32,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dentist {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub specialties: Vec<String>,
    pub active: bool,
}

impl Dentist {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Display-only geography record; never consulted by conflict logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct District {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
}
