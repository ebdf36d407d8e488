use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    #[default]
    Sedan,
    Suv,
    Hatchback,
    Luxury,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaxiStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Taxi {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub driver_name: String,
    pub vehicle_number: String,
    pub vehicle_model: String,
    pub vehicle_type: VehicleType,
    pub license_number: String,
    pub status: TaxiStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
