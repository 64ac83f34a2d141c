use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::models::{Clinic, Dentist, District};

/// Read-only registry over the clinic / dentist / district directories.
///
/// The scheduling engine only reads these records; registration exists so
/// the hosting application (or tests) can seed the directory at startup.
#[derive(Default)]
pub struct DirectoryService {
    clinics: RwLock<HashMap<Uuid, Clinic>>,
    dentists: RwLock<HashMap<Uuid, Dentist>>,
    districts: RwLock<HashMap<Uuid, District>>,
}

impl DirectoryService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register_clinic(&self, clinic: Clinic) {
        debug!("Registering clinic {} ({})", clinic.name, clinic.id);
        self.clinics.write().await.insert(clinic.id, clinic);
    }

    pub async fn register_dentist(&self, dentist: Dentist) {
        debug!("Registering dentist {} ({})", dentist.full_name(), dentist.id);
        self.dentists.write().await.insert(dentist.id, dentist);
    }

    pub async fn register_district(&self, district: District) {
        self.districts.write().await.insert(district.id, district);
    }

    pub async fn get_clinic(&self, id: Uuid) -> Option<Clinic> {
        self.clinics.read().await.get(&id).cloned()
    }

    pub async fn get_dentist(&self, id: Uuid) -> Option<Dentist> {
        self.dentists.read().await.get(&id).cloned()
    }

    pub async fn get_district(&self, id: Uuid) -> Option<District> {
        self.districts.read().await.get(&id).cloned()
    }

    pub async fn list_clinics(&self) -> Vec<Clinic> {
        self.clinics.read().await.values().cloned().collect()
    }

    pub async fn list_dentists(&self) -> Vec<Dentist> {
        self.dentists.read().await.values().cloned().collect()
    }

    /// Room capacity for a clinic, `None` when the clinic is unknown or
    /// inactive. Conflict detection treats `None` as "no room constraint".
    pub async fn clinic_room_capacity(&self, clinic_id: Uuid) -> Option<u32> {
        self.clinics
            .read()
            .await
            .get(&clinic_id)
            .filter(|c| c.active)
            .map(|c| c.capacity_consultorios)
    }

    /// `Some(active)` for a registered dentist, `None` when unknown.
    /// Callers treat unknown as unconstrained; only a dentist known to be
    /// inactive is refused new slots.
    pub async fn dentist_is_active(&self, dentist_id: Uuid) -> Option<bool> {
        self.dentists
            .read()
            .await
            .get(&dentist_id)
            .map(|d| d.active)
    }
}
