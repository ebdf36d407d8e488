use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Catalog entry, read by reference when a tour booking is priced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TourPackage {
    pub id: Uuid,
    pub title: String,
    pub price: f64,
    pub duration: String,
}
